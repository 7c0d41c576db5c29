use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};

/// Default byte budget for stack snapshots attached to recovered panics.
pub const DEFAULT_STACK_TRACE_BYTES: usize = 4096;

/// Run `f`, converting an unwind into the boxed panic payload.
///
/// The single recovery point for handler, callback, job, and destroy paths:
/// abrupt termination becomes a value instead of taking the loop thread down.
#[inline]
pub fn run_guarded<T>(f: impl FnOnce() -> T) -> Result<T, Box<dyn Any + Send>> {
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Extract a printable message from a panic payload.
pub fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic (unknown type)".into())
}

/// Capture the current backtrace, truncated to `limit` bytes. `0` disables.
pub fn capture_stack(limit: usize) -> Option<String> {
    if limit == 0 {
        return None;
    }

    let mut stack = Backtrace::force_capture().to_string();
    if stack.len() > limit {
        // Truncate on a char boundary so the snapshot stays printable.
        let mut end = limit;
        while !stack.is_char_boundary(end) {
            end -= 1;
        }
        stack.truncate(end);
    }
    Some(stack)
}
