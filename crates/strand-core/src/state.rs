//! Fiber execution state

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a fiber
///
/// ```text
///            resume            yield(ready)
///   Init ───────────► Exec ◄──────────────── Ready
///                      │ ▲                     ▲
///        yield(hold)   │ │ resume              │ re-enqueue
///                      ▼ │                     │
///                      Hold ───────────────────┘
///
///   Exec ──entry returns──► Term
///   Exec ──entry panics───► Except
/// ```
///
/// A fiber may only be destroyed in `Init`, `Term` or `Except`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, context seeded, never resumed
    Init = 0,

    /// Runnable; queued (or about to be queued) in a scheduler
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Parked; will not run until something re-enqueues it
    Hold = 3,

    /// Entry closure returned normally
    Term = 4,

    /// Entry closure panicked; panic was captured at the trampoline
    Except = 5,
}

impl FiberState {
    /// Terminal states: the fiber will never run again
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States from which `resume` is legal
    #[inline]
    pub const fn is_resumable(self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Ready | FiberState::Hold
        )
    }

    /// States from which `reset` is legal
    #[inline]
    pub const fn is_resettable(self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Term | FiberState::Except
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init,
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        f.write_str(s)
    }
}

/// Atomic cell holding a [`FiberState`]
///
/// State is read concurrently by the dispatch loop's claim scan while the
/// owning thread transitions it, so plain `Cell` storage is not enough.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    #[inline]
    pub const fn new(state: FiberState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn get(&self) -> FiberState {
        FiberState::from(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: FiberState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Term.is_terminal());
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());

        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(FiberState::Hold.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Term.is_resumable());

        assert!(FiberState::Term.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
    }

    #[test]
    fn test_state_cell() {
        let cell = StateCell::new(FiberState::Init);
        assert_eq!(cell.get(), FiberState::Init);
        cell.set(FiberState::Exec);
        assert_eq!(cell.get(), FiberState::Exec);
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(s as u8), s);
        }
    }
}
