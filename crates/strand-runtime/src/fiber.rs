//! Stackful fibers
//!
//! A fiber is an explicitly switched user-space execution context with its
//! own stack. The first fiber touched on a thread is that thread's *root*
//! fiber: it has no stack of its own (it wraps the OS stack) and is the
//! context everything else ultimately returns to.
//!
//! State machine and switch pairing:
//!
//! - `resume` swaps from the thread's dispatch fiber into the target when
//!   the target participates in scheduling, otherwise from the root fiber.
//! - yielding swaps back to the same partner, forcing `Hold` unless the
//!   fiber is already terminal.
//!
//! A panic escaping the entry closure is captured at the trampoline and
//! parks the fiber in `Except`; there is no cross-fiber panic channel.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{FiberId, FiberState, StateCell};

use crate::arch::{self, SavedRegs};
use crate::config;
use crate::stack::FiberStack;
use crate::tls;

/// Live fibers in the process (root fibers included)
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type EntryFn = Box<dyn FnOnce() + Send>;

/// A stackful coroutine
///
/// Shared as `Arc<Fiber>` between its creator and whatever task queue or
/// event context currently references it. Exactly one thread executes a
/// given fiber at a time; the atomic state cell is what the dispatch
/// loop's claim scan reads concurrently.
pub struct Fiber {
    id: FiberId,
    state: StateCell,
    /// Swap against the dispatch fiber (scheduled) or the root fiber
    run_in_scheduler: bool,
    stack_size: usize,
    /// None for a root fiber, which reuses the OS thread's stack
    stack: Option<FiberStack>,
    ctx: UnsafeCell<SavedRegs>,
    cb: UnsafeCell<Option<EntryFn>>,
    panicked: AtomicBool,
}

// Context and closure slots are only touched by the thread currently
// executing (or seeding) the fiber; cross-thread handoff happens through
// the scheduler queue, which provides the ordering.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber running `cb` on its own stack.
    ///
    /// `stack_size` of 0 selects the configured default
    /// (`config::fiber_stack_size`). `run_in_scheduler` decides which
    /// context the fiber swaps against (see module docs); scheduled work
    /// wants `true`, standalone fibers driven by hand want `false`.
    pub fn new(
        cb: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::fiber_stack_size() as usize
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size).expect("fiber stack allocation failed");

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: StateCell::new(FiberState::Init),
            run_in_scheduler,
            stack_size: stack.size(),
            ctx: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(Some(Box::new(cb))),
            stack: Some(stack),
            panicked: AtomicBool::new(false),
        });

        unsafe {
            arch::current::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                0,
            );
        }

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id = %fiber.id, stack = fiber.stack_size, "fiber created");
        fiber
    }

    /// Wrap the calling thread's native execution flow as its root fiber
    fn new_root() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: StateCell::new(FiberState::Exec),
            run_in_scheduler: false,
            stack_size: 0,
            stack: None,
            ctx: UnsafeCell::new(SavedRegs::zeroed()),
            cb: UnsafeCell::new(None),
            panicked: AtomicBool::new(false),
        });
        tracing::debug!(id = %fiber.id, "root fiber created");
        fiber
    }

    /// The fiber currently executing on this thread.
    ///
    /// Bootstraps the thread's root fiber on first use, so this is also
    /// how a thread opts into running fibers at all.
    pub fn current() -> Arc<Fiber> {
        let p = tls::current_fiber_ptr();
        if !p.is_null() {
            // The raw pointer always aims into a live Arc-managed fiber
            unsafe {
                Arc::increment_strong_count(p);
                Arc::from_raw(p)
            }
        } else {
            let root = Fiber::new_root();
            tls::set_current_fiber(Arc::as_ptr(&root));
            tls::set_root_fiber(root.clone());
            root
        }
    }

    /// Id of the current fiber, or 0 when off-fiber
    #[inline]
    pub fn current_id() -> u64 {
        let p = tls::current_fiber_ptr();
        if p.is_null() {
            0
        } else {
            unsafe { (*p).id.as_u64() }
        }
    }

    /// Switch execution into this fiber.
    ///
    /// Legal from `Init`, `Ready` or `Hold`; returns when the fiber yields
    /// or terminates.
    pub fn resume(self: &Arc<Self>) {
        let st = self.state.get();
        assert!(
            st.is_resumable(),
            "resume on fiber {} in state {}",
            self.id,
            st
        );

        let from = if self.run_in_scheduler {
            let p = tls::dispatch_fiber_ptr();
            assert!(
                !p.is_null(),
                "scheduled fiber {} resumed outside a dispatch loop",
                self.id
            );
            p
        } else {
            if tls::root_fiber_ptr().is_null() {
                // First fiber activity on this thread
                let _ = Fiber::current();
            }
            tls::root_fiber_ptr()
        };

        tls::set_current_fiber(Arc::as_ptr(self));
        self.state.set(FiberState::Exec);
        unsafe {
            arch::current::context_switch((*from).ctx.get(), self.ctx.get());
        }
    }

    /// Switch away from this fiber back to its dispatch/root partner.
    ///
    /// Forces `Hold` unless the fiber is already terminal. Callers outside
    /// this module go through [`Fiber::yield_to_ready`] /
    /// [`Fiber::yield_to_hold`].
    pub(crate) fn yield_back(&self) {
        let st = self.state.get();
        debug_assert!(
            st == FiberState::Exec || st == FiberState::Ready || st.is_terminal(),
            "yield on fiber {} in state {}",
            self.id,
            st
        );

        let from = if self.run_in_scheduler {
            tls::dispatch_fiber_ptr()
        } else {
            tls::root_fiber_ptr()
        };
        assert!(!from.is_null(), "fiber {} has nowhere to yield to", self.id);

        tls::set_current_fiber(from);
        if st == FiberState::Exec {
            self.state.set(FiberState::Hold);
        }
        unsafe {
            arch::current::context_switch(self.ctx.get(), (*from).ctx.get());
        }
    }

    /// Yield the current fiber and mark it `Ready`: the dispatcher will
    /// re-enqueue it immediately.
    pub fn yield_to_ready() {
        let p = tls::current_fiber_ptr();
        assert!(!p.is_null(), "yield_to_ready outside a fiber");
        let cur = unsafe { &*p };
        assert_eq!(cur.state.get(), FiberState::Exec);
        cur.state.set(FiberState::Ready);
        cur.yield_back();
    }

    /// Yield the current fiber and park it in `Hold`: it runs again only
    /// when something (reactor event, timer, explicit schedule) re-enqueues
    /// it.
    pub fn yield_to_hold() {
        let p = tls::current_fiber_ptr();
        assert!(!p.is_null(), "yield_to_hold outside a fiber");
        let cur = unsafe { &*p };
        assert_eq!(cur.state.get(), FiberState::Exec);
        cur.yield_back();
    }

    /// Rebind a finished (or never started) fiber to a new closure,
    /// reusing its stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) {
        let stack = self
            .stack
            .as_ref()
            .expect("cannot reset a root fiber");
        let st = self.state.get();
        assert!(
            st.is_resettable(),
            "reset on fiber {} in state {}",
            self.id,
            st
        );

        unsafe {
            *self.cb.get() = Some(Box::new(cb));
            arch::current::init_context(self.ctx.get(), stack.top(), fiber_main as usize, 0);
        }
        self.panicked.store(false, Ordering::Relaxed);
        self.state.set(FiberState::Ready);
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.set(state);
    }

    /// Stack bytes owned by this fiber (0 for a root fiber)
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Whether the entry closure ended in a captured panic
    #[inline]
    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Live fibers in the process
    #[inline]
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // Destroying a runnable fiber loses its suspended state
            debug_assert!(
                self.state.get().is_resettable(),
                "fiber {} dropped in state {}",
                self.id,
                self.state.get()
            );
        }
        tracing::debug!(id = %self.id, "fiber dropped");
    }
}

/// Entry of every non-root fiber, reached through the arch trampoline.
extern "C" fn fiber_main(_arg: usize) {
    let cur = Fiber::current();
    let cb = unsafe { (*cur.cb.get()).take() };

    match cb {
        Some(cb) => match catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => cur.state.set(FiberState::Term),
            Err(payload) => {
                cur.panicked.store(true, Ordering::Relaxed);
                cur.state.set(FiberState::Except);
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                tracing::error!(id = %cur.id, panic = %msg, "uncaught panic in fiber entry");
            }
        },
        None => cur.state.set(FiberState::Term),
    }

    // This stack still holds a strong reference to the fiber itself; kept
    // across the final switch it would pin the refcount above zero forever.
    // Take the raw pointer, drop the Arc, switch out through the raw.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).yield_back() };

    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_and_finish() {
        let _root = Fiber::current();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let fiber = Fiber::new(move || flag.store(true, Ordering::SeqCst), 16 * 1024, false);
        assert_eq!(fiber.state(), FiberState::Init);

        fiber.resume();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_yield_roundtrip() {
        let _root = Fiber::current();
        let steps = Arc::new(AtomicU64::new(0));
        let s = steps.clone();

        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_hold();
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                s.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
            false,
        );

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Hold);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let _root = Fiber::current();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        let fiber = Fiber::new(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            16 * 1024,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = count.clone();
        fiber.reset(move || {
            c.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(count.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_is_captured() {
        let _root = Fiber::current();
        let fiber = Fiber::new(|| panic!("boom"), 32 * 1024, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        assert!(fiber.panicked());
    }

    #[test]
    fn test_ids_are_distinct() {
        let _root = Fiber::current();
        let a = Fiber::new(|| {}, 16 * 1024, false);
        let b = Fiber::new(|| {}, 16 * 1024, false);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_current_id_off_fiber() {
        // A thread that never touched fibers reports 0
        let id = std::thread::spawn(Fiber::current_id).join().unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn test_nested_fiber_sees_its_own_id() {
        let _root = Fiber::current();
        let observed = Arc::new(AtomicU64::new(0));
        let o = observed.clone();
        let fiber = Fiber::new(
            move || {
                o.store(Fiber::current_id(), Ordering::SeqCst);
            },
            16 * 1024,
            false,
        );
        let expect = fiber.id().as_u64();
        fiber.resume();
        assert_eq!(observed.load(Ordering::SeqCst), expect);
    }
}
