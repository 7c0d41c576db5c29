use crate::console::ConsoleConfig;
use crate::utils::logger::LogConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::DEFAULT_STACK_TRACE_BYTES;

/// Process-wide configuration, read-only after start.
///
/// An explicit value threaded through construction; there is no global
/// configuration state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bytes of stack captured when a recovered panic is reported (`0` = off).
    pub stack_trace_bytes: usize,

    /// Logging setup.
    pub log: LogConfig,

    /// Console shell setup (`port: 0` = disabled).
    pub console: ConsoleConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
            log: LogConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}
