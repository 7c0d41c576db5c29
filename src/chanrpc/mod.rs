//! In-process RPC over bounded typed queues.
//!
//! One `Server` per module loop, one `Client` per caller; neither is shared
//! between threads. Cross-thread traffic happens only through the call and
//! reply queues, so handler execution is serialized by whoever consumes the
//! call queue.

pub use client::Client;
pub use server::{Server, ServerHandle};

mod client;
mod server;

use crate::error::RpcError;
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;

use crossbeam::channel::Sender;

/// A single opaque argument or return value.
pub type Value = Box<dyn Any + Send>;

/// Heterogeneous argument vector carried by a call.
pub type Args = Vec<Value>;

/// Key of a registered function: a name, a numeric id, or a message type.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum FunctionId {
    Name(Cow<'static, str>),
    Num(u64),
    Type(TypeId),
}

impl FunctionId {
    /// Id derived from a message type, for type-keyed routing tables.
    pub fn of<T: 'static>() -> Self {
        FunctionId::Type(TypeId::of::<T>())
    }
}

impl From<&'static str> for FunctionId {
    fn from(s: &'static str) -> Self {
        FunctionId::Name(Cow::Borrowed(s))
    }
}

impl From<String> for FunctionId {
    fn from(s: String) -> Self {
        FunctionId::Name(Cow::Owned(s))
    }
}

impl From<u64> for FunctionId {
    fn from(n: u64) -> Self {
        FunctionId::Num(n)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionId::Name(s) => write!(f, "{s}"),
            FunctionId::Num(n) => write!(f, "{n}"),
            FunctionId::Type(t) => write!(f, "{t:?}"),
        }
    }
}

/// Return shape of a registered function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FnKind {
    /// Takes args, returns nothing.
    NoRet,
    /// Takes args, returns one opaque value.
    Single,
    /// Takes args, returns a vector of opaque values.
    Multi,
}

/// A registered function. The shape is fixed at registration, so arity
/// checking against a caller reduces to comparing [`FnKind`]s.
pub enum Handler {
    NoRet(Box<dyn FnMut(Args) + Send>),
    Single(Box<dyn FnMut(Args) -> Value + Send>),
    Multi(Box<dyn FnMut(Args) -> Vec<Value> + Send>),
}

impl Handler {
    pub fn no_ret(f: impl FnMut(Args) + Send + 'static) -> Self {
        Handler::NoRet(Box::new(f))
    }

    pub fn single(f: impl FnMut(Args) -> Value + Send + 'static) -> Self {
        Handler::Single(Box::new(f))
    }

    pub fn multi(f: impl FnMut(Args) -> Vec<Value> + Send + 'static) -> Self {
        Handler::Multi(Box::new(f))
    }

    pub fn kind(&self) -> FnKind {
        match self {
            Handler::NoRet(_) => FnKind::NoRet,
            Handler::Single(_) => FnKind::Single,
            Handler::Multi(_) => FnKind::Multi,
        }
    }
}

/// User callback for an async call. The shape selects the server-side kind
/// the call requires.
pub enum Callback {
    NoRet(Box<dyn FnOnce(Result<(), RpcError>) + Send>),
    Single(Box<dyn FnOnce(Result<Value, RpcError>) + Send>),
    Multi(Box<dyn FnOnce(Result<Vec<Value>, RpcError>) + Send>),
}

impl Callback {
    pub fn kind(&self) -> FnKind {
        match self {
            Callback::NoRet(_) => FnKind::NoRet,
            Callback::Single(_) => FnKind::Single,
            Callback::Multi(_) => FnKind::Multi,
        }
    }

    /// Deliver a return descriptor to the user callback. The callback shape
    /// matches the recorded kind by construction; a mismatch is a bug.
    pub(crate) fn run(self, ret: Ret, err: Option<RpcError>) {
        match self {
            Callback::NoRet(f) => f(match err {
                Some(e) => Err(e),
                None => Ok(()),
            }),
            Callback::Single(f) => match (err, ret) {
                (Some(e), _) => f(Err(e)),
                (None, Ret::Single(v)) => f(Ok(v)),
                (None, _) => panic!("bug: single-value callback got a mismatched return"),
            },
            Callback::Multi(f) => match (err, ret) {
                (Some(e), _) => f(Err(e)),
                (None, Ret::Multi(vs)) => f(Ok(vs)),
                (None, _) => panic!("bug: multi-value callback got a mismatched return"),
            },
        }
    }
}

/// Opaque return value of an executed handler.
pub enum Ret {
    Unit,
    Single(Value),
    Multi(Vec<Value>),
}

/// The unit of work posted to a server's call queue.
pub struct CallInfo {
    pub(crate) id: FunctionId,
    pub(crate) args: Args,
    /// Absent for fire-and-forget calls.
    pub(crate) ret_tx: Option<Sender<RetInfo>>,
    /// Carried through to the reply so the caller's loop can dispatch it.
    pub(crate) cb: Option<Callback>,
}

/// The reply to a call: a return value, an optional error, and the carried
/// user callback.
pub struct RetInfo {
    pub(crate) ret: Ret,
    pub(crate) err: Option<RpcError>,
    pub(crate) cb: Option<Callback>,
}

impl RetInfo {
    pub(crate) fn ok(ret: Ret) -> Self {
        Self {
            ret,
            err: None,
            cb: None,
        }
    }

    pub(crate) fn err(err: RpcError) -> Self {
        Self {
            ret: Ret::Unit,
            err: Some(err),
            cb: None,
        }
    }

    pub(crate) fn with_cb(err: RpcError, cb: Callback) -> Self {
        Self {
            ret: Ret::Unit,
            err: Some(err),
            cb: Some(cb),
        }
    }
}

/// Build a heterogeneous argument vector: `args![1u32, "hello".to_string()]`.
#[macro_export]
macro_rules! args {
    () => { $crate::chanrpc::Args::new() };
    ($($v:expr),+ $(,)?) => {
        vec![$(Box::new($v) as $crate::chanrpc::Value),+]
    };
}
