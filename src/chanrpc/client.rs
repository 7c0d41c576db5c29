use crate::chanrpc::{Args, CallInfo, Callback, FnKind, FunctionId, Ret, RetInfo, ServerHandle, Value};
use crate::error::RpcError;
use crate::utils::{capture_stack, panic_message, run_guarded, DEFAULT_STACK_TRACE_BYTES};
use crossbeam::channel::{bounded, Receiver, Sender};

/// Caller side of the RPC fabric. Not thread-safe: one client per loop.
///
/// Sync calls rendezvous through a single-slot reply queue. Async calls are
/// admission-controlled against the async reply queue's capacity, so
/// `outstanding` never exceeds it and a reply slot always exists.
pub struct Client {
    server: Option<ServerHandle>,
    sync_ret_tx: Sender<RetInfo>,
    sync_ret_rx: Receiver<RetInfo>,
    async_ret_tx: Sender<RetInfo>,
    async_ret_rx: Receiver<RetInfo>,
    async_cap: usize,
    outstanding: usize,
    stack_trace_bytes: usize,
}

impl Client {
    /// Create a detached client with async reply capacity `l`.
    pub fn new(l: usize) -> Self {
        let (sync_ret_tx, sync_ret_rx) = bounded(1);
        let (async_ret_tx, async_ret_rx) = bounded(l);
        Self {
            server: None,
            sync_ret_tx,
            sync_ret_rx,
            async_ret_tx,
            async_ret_rx,
            async_cap: l,
            outstanding: 0,
            stack_trace_bytes: DEFAULT_STACK_TRACE_BYTES,
        }
    }

    /// Bound the stack snapshot logged on recovered callback panics.
    pub fn with_stack_trace_bytes(mut self, bytes: usize) -> Self {
        self.stack_trace_bytes = bytes;
        self
    }

    /// Bind to a target server. Rebinding between calls is allowed; replies
    /// already in flight still arrive, their route was captured at post time.
    pub fn attach(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    /// The async reply queue, for the owning loop's select.
    pub fn reply_queue(&self) -> &Receiver<RetInfo> {
        &self.async_ret_rx
    }

    /// Synchronous call of a no-return function.
    pub fn call0(&mut self, id: impl Into<FunctionId>, args: Args) -> Result<(), RpcError> {
        let id = id.into();
        self.resolve(&id, FnKind::NoRet)?;
        let ri = self.round_trip(id, args)?;
        match ri.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Synchronous call of a single-return function.
    pub fn call1(&mut self, id: impl Into<FunctionId>, args: Args) -> Result<Value, RpcError> {
        let id = id.into();
        self.resolve(&id, FnKind::Single)?;
        let ri = self.round_trip(id, args)?;
        match (ri.err, ri.ret) {
            (Some(e), _) => Err(e),
            (None, Ret::Single(v)) => Ok(v),
            (None, _) => panic!("bug: single-return call got a mismatched reply"),
        }
    }

    /// Synchronous call of a multi-return function.
    pub fn call_n(&mut self, id: impl Into<FunctionId>, args: Args) -> Result<Vec<Value>, RpcError> {
        let id = id.into();
        self.resolve(&id, FnKind::Multi)?;
        let ri = self.round_trip(id, args)?;
        match (ri.err, ri.ret) {
            (Some(e), _) => Err(e),
            (None, Ret::Multi(vs)) => Ok(vs),
            (None, _) => panic!("bug: multi-return call got a mismatched reply"),
        }
    }

    /// Async call of a no-return function; `cb` runs on the owning loop.
    pub fn async_call0(
        &mut self,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<(), RpcError>) + Send + 'static,
    ) {
        self.async_call(id.into(), args, Callback::NoRet(Box::new(cb)));
    }

    /// Async call of a single-return function; `cb` runs on the owning loop.
    pub fn async_call1(
        &mut self,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<Value, RpcError>) + Send + 'static,
    ) {
        self.async_call(id.into(), args, Callback::Single(Box::new(cb)));
    }

    /// Async call of a multi-return function; `cb` runs on the owning loop.
    pub fn async_call_n(
        &mut self,
        id: impl Into<FunctionId>,
        args: Args,
        cb: impl FnOnce(Result<Vec<Value>, RpcError>) + Send + 'static,
    ) {
        self.async_call(id.into(), args, Callback::Multi(Box::new(cb)));
    }

    /// Dispatch one async reply: account for it, then run its callback under
    /// the panic guard.
    pub fn cb(&mut self, ri: RetInfo) {
        self.outstanding -= 1;
        Self::exec_cb(ri, self.stack_trace_bytes);
    }

    /// Drain replies until no async call is outstanding. Call only when no
    /// further async calls will be initiated.
    pub fn close(&mut self) {
        while self.outstanding > 0 {
            match self.async_ret_rx.recv() {
                Ok(ri) => self.cb(ri),
                Err(_) => break,
            }
        }
    }

    pub fn idle(&self) -> bool {
        self.outstanding == 0
    }

    fn resolve(&self, id: &FunctionId, kind: FnKind) -> Result<(), RpcError> {
        let server = self.server.as_ref().ok_or(RpcError::NotAttached)?;
        match server.kind_of(id) {
            None => Err(RpcError::NotRegistered(id.clone())),
            Some(k) if k != kind => Err(RpcError::KindMismatch(id.clone())),
            Some(_) => Ok(()),
        }
    }

    /// Blocking post with the sync reply slot, then one reply.
    fn round_trip(&mut self, id: FunctionId, args: Args) -> Result<RetInfo, RpcError> {
        let server = self.server.as_ref().ok_or(RpcError::NotAttached)?;
        let ci = CallInfo {
            id,
            args,
            ret_tx: Some(self.sync_ret_tx.clone()),
            cb: None,
        };
        server.post(ci, true).map_err(|(e, _)| e)?;
        self.sync_ret_rx.recv().map_err(|_| RpcError::ServerClosed)
    }

    fn async_call(&mut self, id: FunctionId, args: Args, cb: Callback) {
        // Admission control: at capacity the rejection runs inline, through
        // the same callback path as a delivered reply.
        if self.outstanding >= self.async_cap {
            Self::exec_cb(
                RetInfo::with_cb(RpcError::TooManyCalls, cb),
                self.stack_trace_bytes,
            );
            return;
        }

        let kind = cb.kind();
        match self.resolve(&id, kind) {
            Ok(()) => {
                let ci = CallInfo {
                    id,
                    args,
                    ret_tx: Some(self.async_ret_tx.clone()),
                    cb: Some(cb),
                };
                if let Err((e, ci)) = self.post_async(ci) {
                    if let Some(cb) = ci.cb {
                        self.push_synthetic(e, cb);
                    }
                }
            }
            Err(e) => self.push_synthetic(e, cb),
        }

        // Counted even on the failure paths: the synthetic reply flows back
        // through cb() and decrements like any other.
        self.outstanding += 1;
    }

    fn post_async(&self, ci: CallInfo) -> Result<(), (RpcError, CallInfo)> {
        let server = match self.server.as_ref() {
            Some(s) => s,
            None => return Err((RpcError::NotAttached, ci)),
        };
        server.post(ci, false)
    }

    /// Queue a locally produced error reply. Room is guaranteed: the call was
    /// admitted below capacity, and the queue never holds more replies than
    /// there are outstanding calls.
    fn push_synthetic(&self, err: RpcError, cb: Callback) {
        let _ = self.async_ret_tx.send(RetInfo::with_cb(err, cb));
    }

    fn exec_cb(ri: RetInfo, stack_trace_bytes: usize) {
        let RetInfo { ret, err, cb } = ri;
        let Some(cb) = cb else {
            panic!("bug: async reply without a callback");
        };
        if let Err(payload) = run_guarded(move || cb.run(ret, err)) {
            let msg = panic_message(&payload);
            match capture_stack(stack_trace_bytes) {
                Some(stack) => tracing::error!("[ChanRpc] callback panicked: {msg}: {stack}"),
                None => tracing::error!("[ChanRpc] callback panicked: {msg}"),
            }
        }
    }
}
