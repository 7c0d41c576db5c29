use crate::chanrpc::{Args, Client, FunctionId, Handler, Server, ServerHandle, Value};
use crate::console::CommandRegistry;
use crate::error::RpcError;
use crate::module::CloseSignal;
use crate::pool::{LinearContext, Pool};
use crate::timer::{Cron, CronExpr, Dispatcher, Timer};
use crate::utils::DEFAULT_STACK_TRACE_BYTES;
use crossbeam::channel::select;
use std::sync::Arc;
use std::time::Duration;

/// Which facilities a skeleton allocates. A length of zero disables the
/// facility; using a disabled facility is a programming error and panics.
pub struct SkeletonConfig {
    /// Worker pool size.
    pub go_len: usize,
    /// Fired-timer queue capacity.
    pub timer_dispatcher_len: usize,
    /// Async reply queue capacity, which also caps outstanding async calls.
    pub async_call_len: usize,
    /// Bytes of stack captured on recovered panics (`0` = off).
    pub stack_trace_bytes: usize,
    /// Console registry to list commands in, when the module exposes any.
    pub command_registry: Option<Arc<CommandRegistry>>,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            go_len: 0,
            timer_dispatcher_len: 0,
            async_call_len: 0,
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
            command_registry: None,
        }
    }
}

/// Per-module event-loop scaffold: multiplexes inbound RPC, command RPC,
/// async replies, pool callbacks, and timer fires onto the module's single
/// thread of control. Handlers therefore never run concurrently with each
/// other and module state needs no locks.
pub struct Skeleton {
    cfg: SkeletonConfig,
    pool: Pool,
    dispatcher: Dispatcher,
    client: Client,
    server: Server,
    command_server: Server,
    user_server: bool,
}

impl Skeleton {
    /// Build a skeleton with a private zero-capacity RPC server.
    pub fn new(cfg: SkeletonConfig) -> anyhow::Result<Self> {
        Self::build(cfg, None)
    }

    /// Build a skeleton serving inbound RPC from a user-supplied server.
    pub fn with_server(cfg: SkeletonConfig, server: Server) -> anyhow::Result<Self> {
        Self::build(cfg, Some(server))
    }

    fn build(cfg: SkeletonConfig, server: Option<Server>) -> anyhow::Result<Self> {
        let stack = cfg.stack_trace_bytes;
        let user_server = server.is_some();
        let server = server.unwrap_or_else(|| Server::new(0).with_stack_trace_bytes(stack));

        Ok(Self {
            pool: Pool::new(cfg.go_len)?.with_stack_trace_bytes(stack),
            dispatcher: Dispatcher::new(cfg.timer_dispatcher_len)?.with_stack_trace_bytes(stack),
            client: Client::new(cfg.async_call_len).with_stack_trace_bytes(stack),
            server,
            command_server: Server::new(0).with_stack_trace_bytes(stack),
            user_server,
            cfg,
        })
    }

    /// Handle for posting calls into this module.
    pub fn server_handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Handle of the private command-RPC server.
    pub fn command_handle(&self) -> ServerHandle {
        self.command_server.handle()
    }

    /// The module loop. Selects over the close signal and every enabled
    /// facility queue; selection among ready queues is unbiased. Returns
    /// after the close signal arrives and teardown has drained everything.
    pub fn run(&mut self, close_sig: CloseSignal) {
        let async_rx = self.client.reply_queue().clone();
        let call_rx = self.server.call_queue().clone();
        let command_rx = self.command_server.call_queue().clone();
        let pool_rx = self.pool.callback_queue().clone();
        let timer_rx = self.dispatcher.fired_queue().clone();

        loop {
            select! {
                recv(close_sig) -> _ => {
                    self.command_server.close();
                    self.server.close();
                    // Handlers finishing up may have submitted one last job
                    // or async call; pump until both report idle.
                    while !self.pool.idle() || !self.client.idle() {
                        self.pool.close();
                        self.client.close();
                    }
                    return;
                }
                recv(async_rx) -> ri => {
                    if let Ok(ri) = ri {
                        self.client.cb(ri);
                    }
                }
                recv(call_rx) -> ci => {
                    if let Ok(ci) = ci {
                        self.server.exec(ci);
                    }
                }
                recv(command_rx) -> ci => {
                    if let Ok(ci) = ci {
                        self.command_server.exec(ci);
                    }
                }
                recv(pool_rx) -> cb => {
                    if let Ok(cb) = cb {
                        self.pool.cb(cb);
                    }
                }
                recv(timer_rx) -> fired => {
                    if let Ok(fired) = fired {
                        fired.fire();
                    }
                }
            }
        }
    }

    /// Arm a one-shot timer on this module's dispatcher.
    pub fn after_func(&self, d: Duration, cb: impl FnMut() + Send + 'static) -> Timer {
        if self.cfg.timer_dispatcher_len == 0 {
            panic!("invalid timer_dispatcher_len");
        }
        self.dispatcher.after_func(d, cb)
    }

    /// Arm a cron timer on this module's dispatcher.
    pub fn cron_func(&self, expr: CronExpr, cb: impl FnMut() + Send + 'static) -> Cron {
        if self.cfg.timer_dispatcher_len == 0 {
            panic!("invalid timer_dispatcher_len");
        }
        self.dispatcher.cron_func(expr, cb)
    }

    /// Offload `f` to the pool; `cb` comes back through this loop.
    pub fn go(&self, f: impl FnOnce() + Send + 'static, cb: impl FnOnce() + Send + 'static) {
        if self.cfg.go_len == 0 {
            panic!("invalid go_len");
        }
        self.pool.go(f, cb);
    }

    /// A single-worker sub-pool preserving submission order.
    pub fn new_linear_context(&self) -> anyhow::Result<LinearContext> {
        if self.cfg.go_len == 0 {
            panic!("invalid go_len");
        }
        self.pool.new_linear_context()
    }

    /// Async no-return call against `server`; the callback runs on this loop.
    pub fn async_call0(
        &mut self,
        server: &ServerHandle,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<(), RpcError>) + Send + 'static,
    ) {
        if self.cfg.async_call_len == 0 {
            panic!("invalid async_call_len");
        }
        self.client.attach(server.clone());
        self.client.async_call0(id, args, cb);
    }

    /// Async single-return call against `server`.
    pub fn async_call1(
        &mut self,
        server: &ServerHandle,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<Value, RpcError>) + Send + 'static,
    ) {
        if self.cfg.async_call_len == 0 {
            panic!("invalid async_call_len");
        }
        self.client.attach(server.clone());
        self.client.async_call1(id, args, cb);
    }

    /// Async multi-return call against `server`.
    pub fn async_call_n(
        &mut self,
        server: &ServerHandle,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static,
    ) {
        if self.cfg.async_call_len == 0 {
            panic!("invalid async_call_len");
        }
        self.client.attach(server.clone());
        self.client.async_call_n(id, args, cb);
    }

    /// Register an RPC handler on the user-supplied server.
    pub fn register_chan_rpc(&mut self, id: impl Into<FunctionId>, f: Handler) {
        if !self.user_server {
            panic!("invalid chanrpc server");
        }
        if let Err(e) = self.server.register(id, f) {
            panic!("chanrpc registration failed: {e}");
        }
    }

    /// Register a console command, dispatched over the command-RPC queue.
    /// Console output requires `f` to be a single-return function yielding a
    /// `String`.
    pub fn register_command(&mut self, name: &str, help: &str, f: Handler) {
        if let Err(e) = self
            .command_server
            .register(FunctionId::from(name.to_string()), f)
        {
            panic!("command registration failed: {e}");
        }
        if let Some(registry) = &self.cfg.command_registry {
            if let Err(e) = registry.register(name, help, self.command_server.handle()) {
                panic!("command registration failed: {e}");
            }
        }
    }
}
