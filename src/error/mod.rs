use crate::chanrpc::FunctionId;
use std::{error::Error, fmt};

const ERR_MSG_NOT_REGISTERED: &str = "function not registered";
const ERR_MSG_KIND_MISMATCH: &str = "return type mismatch";
const ERR_MSG_ALREADY_REGISTERED: &str = "already registered";
const ERR_MSG_QUEUE_FULL: &str = "call queue is full";
const ERR_MSG_TOO_MANY_CALLS: &str = "too many calls";
const ERR_MSG_SERVER_CLOSED: &str = "chanrpc server closed";
const ERR_MSG_NOT_ATTACHED: &str = "server not attached";

/// What a handler panicked with, plus an optional bounded stack snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicTrace {
    pub message: String,
    pub stack: Option<String>,
}

impl fmt::Display for PanicTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => write!(f, "{}: {}", self.message, stack),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Domain errors of the chanRPC fabric.
///
/// Every error that can reach a caller travels inside a `RetInfo`; the rest
/// are logged at the point they occur.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcError {
    /// Unknown function id at call time.
    NotRegistered(FunctionId),
    /// Caller's expected return shape does not match the registered kind.
    KindMismatch(FunctionId),
    /// Registration attempted for an id that already has a handler.
    AlreadyRegistered(FunctionId),
    /// Non-blocking enqueue found the call queue full.
    QueueFull,
    /// Async admission control rejected the call.
    TooManyCalls,
    /// Server shut down before or while the call was pending.
    ServerClosed,
    /// Client used before `attach`.
    NotAttached,
    /// Handler aborted; carries the panic payload and bounded stack.
    HandlerPanic(PanicTrace),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::NotRegistered(id) => {
                write!(f, "function id {id}: {ERR_MSG_NOT_REGISTERED}")
            }
            RpcError::KindMismatch(id) => {
                write!(f, "function id {id}: {ERR_MSG_KIND_MISMATCH}")
            }
            RpcError::AlreadyRegistered(id) => {
                write!(f, "function id {id}: {ERR_MSG_ALREADY_REGISTERED}")
            }
            RpcError::QueueFull => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            RpcError::TooManyCalls => write!(f, "{ERR_MSG_TOO_MANY_CALLS}"),
            RpcError::ServerClosed => write!(f, "{ERR_MSG_SERVER_CLOSED}"),
            RpcError::NotAttached => write!(f, "{ERR_MSG_NOT_ATTACHED}"),
            RpcError::HandlerPanic(trace) => write!(f, "handler panic: {trace}"),
        }
    }
}

impl Error for RpcError {}
