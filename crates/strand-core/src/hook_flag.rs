//! Hook enablement flags
//!
//! Two switches gate the syscall interception layer: a process-wide flag
//! (on by default) and a per-thread flag (off by default, enabled by
//! scheduler workers when they start). A hooked primitive takes the fiber
//! path only when both are set, so application threads outside the runtime
//! always get the raw libc behavior.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

static PROCESS_HOOK_ENABLED: AtomicBool = AtomicBool::new(true);

thread_local! {
    static THREAD_HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// True when the calling thread should take the fiber path in hooked calls
#[inline]
pub fn is_hook_enable() -> bool {
    PROCESS_HOOK_ENABLED.load(Ordering::Relaxed) && THREAD_HOOK_ENABLED.with(|c| c.get())
}

/// Enable or disable hooking process-wide
#[inline]
pub fn set_hook_enable(enable: bool) {
    PROCESS_HOOK_ENABLED.store(enable, Ordering::Relaxed);
}

/// Enable or disable hooking for the calling thread only.
///
/// Worker threads call this with `true` on startup; a worker can turn it
/// off temporarily to force raw syscalls from a hooked context.
#[inline]
pub fn set_thread_hook_enable(enable: bool) {
    THREAD_HOOK_ENABLED.with(|c| c.set(enable));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flags() {
        // Off until the thread opts in
        assert!(!is_hook_enable());

        set_thread_hook_enable(true);
        assert!(is_hook_enable());

        // Process-wide override wins
        set_hook_enable(false);
        assert!(!is_hook_enable());
        set_hook_enable(true);
        assert!(is_hook_enable());

        set_thread_hook_enable(false);
        assert!(!is_hook_enable());
    }
}
