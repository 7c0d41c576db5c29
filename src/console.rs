//! Line-oriented TCP command shell.
//!
//! External commands are registered through a module's command-RPC server and
//! dispatched with a synchronous single-value call, so they execute on the
//! owning module's loop; the console threads only move bytes.

use crate::chanrpc::{Args, FunctionId, ServerHandle, Value};
use anyhow::{bail, Context};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const READ_POLL: Duration = Duration::from_millis(200);

/// Console shell setup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// TCP port on localhost; `0` disables the console.
    pub port: u16,
    /// Prompt written before each command; empty suppresses it.
    pub prompt: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            port: 0,
            prompt: "atlasrt# ".to_string(),
        }
    }
}

struct ExternalCommand {
    name: String,
    help: String,
    server: ServerHandle,
}

/// Shared list of console commands. An explicit value handed to the skeletons
/// that want to expose commands; there is no process-global registry.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Mutex<Vec<ExternalCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List a command backed by `server`, where a single-return function is
    /// registered under `name`. Duplicate names are rejected.
    pub fn register(&self, name: &str, help: &str, server: ServerHandle) -> anyhow::Result<()> {
        let mut commands = self.commands.lock();
        if name == "help" || name == "quit" || commands.iter().any(|c| c.name == name) {
            bail!("command {name} is already registered");
        }
        commands.push(ExternalCommand {
            name: name.to_string(),
            help: help.to_string(),
            server,
        });
        Ok(())
    }

    pub fn help_text(&self) -> String {
        let mut out = String::from("Commands:\r\n");
        out.push_str("help - this help text\r\n");
        for c in self.commands.lock().iter() {
            out.push_str(&format!("{} - {}\r\n", c.name, c.help));
        }
        out.push_str("quit - exit console");
        out
    }

    /// Run a registered command; `None` when the name is unknown.
    pub fn dispatch(&self, name: &str, args: &[&str]) -> Option<String> {
        let server = self
            .commands
            .lock()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.server.clone())?;

        let call_args: Args = args
            .iter()
            .map(|a| Box::new(a.to_string()) as Value)
            .collect();

        let output = match server.call1(FunctionId::from(name.to_string()), call_args) {
            Ok(value) => match value.downcast::<String>() {
                Ok(s) => *s,
                Err(_) => "invalid output type".to_string(),
            },
            Err(e) => e.to_string(),
        };
        Some(output)
    }
}

/// The console service: an accept thread plus one thread per connection.
pub struct Console {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Console {
    /// Bind and start serving; `port: 0` yields an inert console.
    pub fn start(cfg: &ConsoleConfig, registry: Arc<CommandRegistry>) -> anyhow::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));

        if cfg.port == 0 {
            return Ok(Self {
                shutdown,
                join: None,
            });
        }

        let listener = TcpListener::bind(("127.0.0.1", cfg.port))
            .with_context(|| format!("failed to bind console port {}", cfg.port))?;
        listener
            .set_nonblocking(true)
            .context("failed to set console listener non-blocking")?;

        let flag = shutdown.clone();
        let prompt = cfg.prompt.clone();
        let join = thread::Builder::new()
            .name("console-accept".to_string())
            .spawn(move || accept_loop(listener, prompt, registry, flag))
            .context("failed to spawn console accept thread")?;

        tracing::info!("[Console] listening on 127.0.0.1:{}", cfg.port);

        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    /// Stop accepting and wind down connection threads.
    pub fn destroy(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    prompt: String,
    registry: Arc<CommandRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("[Console] connection from {peer}");
                let prompt = prompt.clone();
                let registry = registry.clone();
                let shutdown = shutdown.clone();
                let spawned = thread::Builder::new()
                    .name("console-conn".to_string())
                    .spawn(move || handle_conn(stream, prompt, registry, shutdown));
                if let Err(e) = spawned {
                    tracing::error!("[Console] failed to spawn connection thread: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::error!("[Console] accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_conn(
    stream: TcpStream,
    prompt: String,
    registry: Arc<CommandRegistry>,
    shutdown: Arc<AtomicBool>,
) {
    let _ = stream.set_read_timeout(Some(READ_POLL));
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(reader_stream);
    let mut stream = stream;
    let mut line = String::new();

    loop {
        if !prompt.is_empty() && stream.write_all(prompt.as_bytes()).is_err() {
            return;
        }

        line.clear();
        loop {
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }

        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else { continue };
        let cmd_args: Vec<&str> = parts.collect();

        if name == "quit" {
            return;
        }

        let output = if name == "help" {
            registry.help_text()
        } else {
            match registry.dispatch(name, &cmd_args) {
                Some(output) => output,
                None => "command not found, try `help` for help".to_string(),
            }
        };

        if !output.is_empty() && stream.write_all(format!("{output}\r\n").as_bytes()).is_err() {
            return;
        }
    }
}
