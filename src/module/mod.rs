//! Module lifecycle: ordered init, one loop thread per module, reverse-order
//! teardown with panic isolation.

pub use skeleton::{Skeleton, SkeletonConfig};

mod skeleton;

use crate::utils::{capture_stack, panic_message, run_guarded, DEFAULT_STACK_TRACE_BYTES};
use anyhow::Context;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// A module's private shutdown signal: a single-slot queue that receives
/// exactly one value, which `run` must drain to begin graceful termination.
pub type CloseSignal = Receiver<()>;

/// A lifecycle-managed unit with its own event loop.
pub trait Module: Send {
    /// One-time synchronous setup; runs before any module's loop starts.
    /// A panic here aborts process startup.
    fn on_init(&mut self);

    /// The module's loop. Must terminate after `close_sig` yields a value.
    fn run(&mut self, close_sig: CloseSignal);

    /// One-time synchronous teardown; runs after `run` has returned. Panics
    /// are tolerated and do not stop the teardown of other modules.
    fn on_destroy(&mut self);
}

/// Interface a networked connection implements to act as a module's I/O
/// endpoint; consumed by the external network layer.
pub trait Agent: Send {
    fn run(&mut self);
    fn on_close(&mut self);
}

struct Slot {
    module: Option<Box<dyn Module>>,
    close_tx: Sender<()>,
    close_rx: Option<CloseSignal>,
    join: Option<JoinHandle<Box<dyn Module>>>,
}

/// Ordered registry of modules. Registration order drives `init`; `destroy`
/// walks it in reverse so later modules can still reach their dependencies
/// while shutting down.
pub struct ModuleManager {
    slots: Vec<Slot>,
    stack_trace_bytes: usize,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
        }
    }

    /// Bound the stack snapshot logged on recovered teardown panics.
    pub fn with_stack_trace_bytes(mut self, bytes: usize) -> Self {
        self.stack_trace_bytes = bytes;
        self
    }

    /// Append a module. Not concurrency-safe; must precede `init`.
    pub fn register(&mut self, module: impl Module + 'static) {
        self.register_boxed(Box::new(module));
    }

    pub fn register_boxed(&mut self, module: Box<dyn Module>) {
        let (close_tx, close_rx) = bounded(1);
        self.slots.push(Slot {
            module: Some(module),
            close_tx,
            close_rx: Some(close_rx),
            join: None,
        });
    }

    /// Run every `on_init` in registration order, then launch one loop thread
    /// per module. Initialization errors abort startup.
    pub fn init(&mut self) -> anyhow::Result<()> {
        for slot in &mut self.slots {
            if let Some(module) = &mut slot.module {
                module.on_init();
            }
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(mut module) = slot.module.take() else {
                continue;
            };
            let Some(close_rx) = slot.close_rx.take() else {
                continue;
            };

            let handle = thread::Builder::new()
                .name(format!("module-{i}"))
                .spawn(move || {
                    module.run(close_rx);
                    module
                })
                .with_context(|| format!("failed to spawn module-{i} thread"))?;

            slot.join = Some(handle);
        }

        Ok(())
    }

    /// Tear down in reverse registration order: signal, wait for the loop,
    /// then `on_destroy` under the panic guard. Idempotent.
    pub fn destroy(&mut self) {
        while let Some(slot) = self.slots.pop() {
            let _ = slot.close_tx.try_send(());

            match slot.join {
                Some(handle) => match handle.join() {
                    Ok(mut module) => self.destroy_module(&mut *module),
                    Err(payload) => tracing::error!(
                        "[ModuleManager] module thread died: {}",
                        panic_message(&payload)
                    ),
                },
                // init never ran for this module; still give it its teardown.
                None => {
                    if let Some(mut module) = slot.module {
                        self.destroy_module(&mut *module);
                    }
                }
            }
        }
    }

    fn destroy_module(&self, module: &mut dyn Module) {
        if let Err(payload) = run_guarded(|| module.on_destroy()) {
            let msg = panic_message(&payload);
            match capture_stack(self.stack_trace_bytes) {
                Some(stack) => {
                    tracing::error!("[ModuleManager] on_destroy panicked: {msg}: {stack}")
                }
                None => tracing::error!("[ModuleManager] on_destroy panicked: {msg}"),
            }
        }
    }
}
