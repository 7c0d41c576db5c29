//! Process driver: wires modules, the console, and termination signals into
//! one blocking `run`.

use crate::config::RuntimeConfig;
use crate::console::{CommandRegistry, Console};
use crate::module::{Module, ModuleManager};
use anyhow::Context;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// An application instance: configuration, module registry, and console
/// command registry as one explicit value. Several instances can coexist,
/// which keeps multi-runtime tests trivial.
pub struct App {
    cfg: RuntimeConfig,
    manager: ModuleManager,
    command_registry: Arc<CommandRegistry>,
}

impl App {
    pub fn new(cfg: RuntimeConfig) -> Self {
        let manager = ModuleManager::new().with_stack_trace_bytes(cfg.stack_trace_bytes);
        Self {
            cfg,
            manager,
            command_registry: Arc::new(CommandRegistry::new()),
        }
    }

    /// Registry to hand to skeletons that expose console commands.
    pub fn command_registry(&self) -> Arc<CommandRegistry> {
        self.command_registry.clone()
    }

    /// Register a module; order here is init order and reverse destroy order.
    pub fn register(&mut self, module: impl Module + 'static) {
        self.manager.register(module);
    }

    /// Initialize logging and modules, start the console, then block until an
    /// interrupt or terminate signal arrives and tear everything down.
    pub fn run(mut self) -> anyhow::Result<()> {
        let _log_guard = self.cfg.log.init()?;

        tracing::info!("[App] starting up");

        self.manager.init()?;

        let console = Console::start(&self.cfg.console, self.command_registry.clone())?;

        let term = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            flag::register(*sig, term.clone())
                .with_context(|| format!("failed to register signal {sig}"))?;
        }

        while !term.load(Ordering::Relaxed) {
            thread::sleep(SIGNAL_POLL);
        }

        tracing::info!("[App] closing down");

        console.destroy();
        self.manager.destroy();

        Ok(())
    }
}
