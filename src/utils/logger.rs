use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logging setup for the process.
///
/// With `file_dir` set, output goes to a rolling file through a non-blocking
/// writer; otherwise to stdout.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LogConfig {
    /// Minimum level (`error` | `warn` | `info` | `debug` | `trace`).
    pub level: String,
    /// Directory for rolling log files (`None` = stdout).
    pub file_dir: Option<String>,
    /// Log file name prefix.
    #[serde(default)]
    pub file_prefix: String,
    /// Rotation period (`daily` | `hourly` | `minutely`).
    pub rolling: Option<String>,
    /// How many rotated files to keep.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_files() -> usize {
    2
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: String::new(),
            rolling: Some("daily".to_string()),
            max_files: default_max_files(),
        }
    }
}

impl LogConfig {
    /// Install the global subscriber. The returned guard must be kept alive
    /// for the lifetime of the process when logging to a file.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        if let Some(dir) = self.file_dir.as_deref() {
            let rotation = match self.rolling.as_deref() {
                Some("hourly") => Rotation::HOURLY,
                Some("minutely") => Rotation::MINUTELY,
                _ => Rotation::DAILY,
            };

            let appender: RollingFileAppender = RollingFileAppender::builder()
                .rotation(rotation)
                .max_log_files(self.max_files.max(1))
                .filename_prefix(&self.file_prefix)
                .build(dir)
                .with_context(|| format!("failed to create rolling appender in {dir}"))?;

            let (writer, guard) = tracing_appender::non_blocking(appender);

            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(writer)
                .try_init();

            Ok(Some(guard))
        } else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            Ok(None)
        }
    }
}
