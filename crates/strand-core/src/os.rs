//! Thin OS helpers shared by the runtime crates

use std::time::{SystemTime, UNIX_EPOCH};

/// Kernel thread id of the calling thread.
///
/// This is the `gettid` value, not `pthread_self`: it is what task
/// thread-affinity is expressed in, and it is stable for the life of the
/// thread.
#[inline]
pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Current wall-clock time in milliseconds since the epoch.
///
/// Timer deadlines are wall-clock on purpose: a clock jumped backwards is
/// detected by the timer manager's rollover check instead of silently
/// stranding timers.
#[inline]
pub fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Read the calling thread's errno
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Set the calling thread's errno
#[inline]
pub fn set_errno(v: i32) {
    unsafe { *libc::__errno_location() = v }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let main_id = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, other);
    }

    #[test]
    fn test_current_ms_advances() {
        let a = current_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = current_ms();
        assert!(b >= a + 4);
    }

    #[test]
    fn test_errno_roundtrip() {
        set_errno(libc::ETIMEDOUT);
        assert_eq!(errno(), libc::ETIMEDOUT);
        set_errno(0);
    }
}
