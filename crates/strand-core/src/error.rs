//! Error types for the strand runtime

use std::io;
use thiserror::Error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the runtime.
///
/// Precondition violations (double-arming an event, resuming a fiber in the
/// wrong state, scheduling after stop) are asserts, not error values: the
/// runtime assumes a correct caller. These variants cover environment
/// failures the caller can meaningfully observe.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// epoll instance or wakeup pipe could not be created
    #[error("reactor setup failed: {0}")]
    ReactorSetup(#[source] io::Error),

    /// An epoll_ctl call was rejected by the kernel
    #[error("epoll_ctl {op} fd={fd} events={events:#x} failed: {source}")]
    EpollCtl {
        op: &'static str,
        fd: i32,
        events: u32,
        #[source]
        source: io::Error,
    },

    /// Fiber stack mapping failed
    #[error("stack mapping of {size} bytes failed: {source}")]
    StackAlloc {
        size: usize,
        #[source]
        source: io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::EpollCtl {
            op: "ADD",
            fd: 7,
            events: 0x5,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        let msg = format!("{}", e);
        assert!(msg.contains("ADD"));
        assert!(msg.contains("fd=7"));
    }
}
