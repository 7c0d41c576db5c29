use crate::chanrpc::{Args, CallInfo, Callback, Client, FnKind, FunctionId, Handler, Ret, RetInfo, Value};
use crate::error::{PanicTrace, RpcError};
use crate::utils::{capture_stack, panic_message, run_guarded, DEFAULT_STACK_TRACE_BYTES};
use ahash::AHashMap;
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use crossbeam::utils::Backoff;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// State shared between a server and every handle pointing at it.
///
/// The kind table is written only during module init and read-locked
/// afterwards; the call queue plus the closed/in-flight pair implement the
/// shutdown protocol (flag checked before send, counter drained on close).
struct Shared {
    kinds: RwLock<AHashMap<FunctionId, FnKind>>,
    call_tx: Sender<CallInfo>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    dropped: AtomicU64,
}

/// Cheap cloneable sender side of a server. This is what other modules hold
/// to post calls; the owning module keeps the [`Server`] itself.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Fire-and-forget call, blocking while the call queue is full.
    ///
    /// Unknown ids and calls racing shutdown are dropped silently;
    /// [`dropped_casts`](Self::dropped_casts) counts them.
    pub fn cast(&self, id: impl Into<FunctionId>, args: Args) {
        let id = id.into();
        if self.kind_of(&id).is_none() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let ci = CallInfo {
            id,
            args,
            ret_tx: None,
            cb: None,
        };
        if self.post(ci, true).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fire-and-forget call that drops instead of blocking on a full queue.
    pub fn try_cast(&self, id: impl Into<FunctionId>, args: Args) {
        let id = id.into();
        if self.kind_of(&id).is_none() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let ci = CallInfo {
            id,
            args,
            ret_tx: None,
            cb: None,
        };
        if self.post(ci, false).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Synchronous call of a no-return function via a transient client.
    pub fn call0(&self, id: impl Into<FunctionId>, args: Args) -> Result<(), RpcError> {
        self.open(0).call0(id, args)
    }

    /// Synchronous call of a single-return function via a transient client.
    pub fn call1(&self, id: impl Into<FunctionId>, args: Args) -> Result<Value, RpcError> {
        self.open(0).call1(id, args)
    }

    /// Synchronous call of a multi-return function via a transient client.
    pub fn call_n(&self, id: impl Into<FunctionId>, args: Args) -> Result<Vec<Value>, RpcError> {
        self.open(0).call_n(id, args)
    }

    /// Create a client with async capacity `l`, attached to this server.
    pub fn open(&self, l: usize) -> Client {
        let mut c = Client::new(l);
        c.attach(self.clone());
        c
    }

    /// How many fire-and-forget calls were dropped (unknown id or shutdown).
    pub fn dropped_casts(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn kind_of(&self, id: &FunctionId) -> Option<FnKind> {
        self.shared.kinds.read().get(id).copied()
    }

    /// Post a call under the shutdown protocol. On failure the descriptor is
    /// handed back so async callers can recover their callback.
    pub(crate) fn post(&self, ci: CallInfo, block: bool) -> Result<(), (RpcError, CallInfo)> {
        let shared = &self.shared;

        // The increment-then-check order pairs with close(): any sender that
        // saw the flag unset is counted before close starts draining.
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err((RpcError::ServerClosed, ci));
        }

        let res = if block {
            shared
                .call_tx
                .send(ci)
                .map_err(|e| (RpcError::ServerClosed, e.into_inner()))
        } else {
            shared.call_tx.try_send(ci).map_err(|e| match e {
                TrySendError::Full(ci) => (RpcError::QueueFull, ci),
                TrySendError::Disconnected(ci) => (RpcError::ServerClosed, ci),
            })
        };

        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

/// The receiving side of the RPC fabric: a function table plus a bounded FIFO
/// call queue. Owned by exactly one module loop, which is the only executor of
/// handlers, so the table needs no locking on the exec path.
pub struct Server {
    shared: Arc<Shared>,
    handlers: AHashMap<FunctionId, Handler>,
    call_rx: Receiver<CallInfo>,
    stack_trace_bytes: usize,
}

impl Server {
    /// Create a server with a call queue of capacity `len`.
    pub fn new(len: usize) -> Self {
        let (call_tx, call_rx) = bounded(len);
        Self {
            shared: Arc::new(Shared {
                kinds: RwLock::new(AHashMap::new()),
                call_tx,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
            }),
            handlers: AHashMap::new(),
            call_rx,
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
        }
    }

    /// Bound the stack snapshot attached to recovered handler panics.
    pub fn with_stack_trace_bytes(mut self, bytes: usize) -> Self {
        self.stack_trace_bytes = bytes;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// The inbound call queue, for the owning loop's select.
    pub fn call_queue(&self) -> &Receiver<CallInfo> {
        &self.call_rx
    }

    /// Register a handler. Registrations happen during module init, before
    /// the table is shared through calls; re-registering an id fails and
    /// leaves the table unchanged.
    pub fn register(&mut self, id: impl Into<FunctionId>, f: Handler) -> Result<(), RpcError> {
        let id = id.into();
        if self.handlers.contains_key(&id) {
            return Err(RpcError::AlreadyRegistered(id));
        }
        self.shared.kinds.write().insert(id.clone(), f.kind());
        self.handlers.insert(id, f);
        Ok(())
    }

    /// Execute one call descriptor and post its reply, if it carries a reply
    /// queue. A handler panic becomes a `handler-panic` reply instead of
    /// taking the loop down.
    pub fn exec(&mut self, ci: CallInfo) {
        let CallInfo {
            id,
            args,
            ret_tx,
            cb,
        } = ci;

        let Some(handler) = self.handlers.get_mut(&id) else {
            Self::ret(ret_tx, RetInfo::err(RpcError::NotRegistered(id)), cb);
            return;
        };

        let result = match handler {
            Handler::NoRet(f) => run_guarded(move || {
                f(args);
                Ret::Unit
            }),
            Handler::Single(f) => run_guarded(move || Ret::Single(f(args))),
            Handler::Multi(f) => run_guarded(move || Ret::Multi(f(args))),
        };

        match result {
            Ok(ret) => Self::ret(ret_tx, RetInfo::ok(ret), cb),
            Err(payload) => {
                let trace = PanicTrace {
                    message: panic_message(&payload),
                    stack: capture_stack(self.stack_trace_bytes),
                };
                tracing::error!("[ChanRpc] handler {id} panicked: {}", trace.message);
                Self::ret(ret_tx, RetInfo::err(RpcError::HandlerPanic(trace)), cb);
            }
        }
    }

    /// Close the server: late senders observe `server-closed`, and every call
    /// already admitted is drained with a `server-closed` reply. Idempotent.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Drain until the queue is empty and no sender is mid-post; draining
        // also unblocks senders stuck on a full queue so they land here.
        let backoff = Backoff::new();
        loop {
            match self.call_rx.try_recv() {
                Ok(ci) => {
                    Self::ret(ci.ret_tx, RetInfo::err(RpcError::ServerClosed), ci.cb);
                }
                Err(TryRecvError::Empty) => {
                    if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    backoff.snooze();
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Deliver a reply. Failures here mean the caller's reply queue is gone;
    /// they are logged and swallowed so draining continues.
    fn ret(ret_tx: Option<Sender<RetInfo>>, mut ri: RetInfo, cb: Option<Callback>) {
        let Some(tx) = ret_tx else { return };
        ri.cb = cb;
        if tx.send(ri).is_err() {
            tracing::error!("[ChanRpc] reply delivery failed: reply queue dropped");
        }
    }
}
