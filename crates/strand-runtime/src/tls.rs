//! Thread-local anchors
//!
//! Four per-thread slots tie the runtime together:
//!
//! - the *current* fiber (raw pointer, owned elsewhere),
//! - the *root* fiber (owning handle; wraps the OS thread's native stack),
//! - the *dispatch* fiber (raw pointer; the context scheduled fibers swap
//!   against — a worker's root fiber, or the dedicated dispatch fiber on a
//!   use_caller thread),
//! - the current scheduler handle.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    static DISPATCH_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current_fiber(f: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(f));
}

#[inline]
pub(crate) fn root_fiber_ptr() -> *const Fiber {
    ROOT_FIBER.with(|r| {
        r.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |f| Arc::as_ptr(f))
    })
}

#[inline]
pub(crate) fn set_root_fiber(f: Arc<Fiber>) {
    ROOT_FIBER.with(|r| *r.borrow_mut() = Some(f));
}

#[inline]
pub(crate) fn dispatch_fiber_ptr() -> *const Fiber {
    DISPATCH_FIBER.with(|c| c.get())
}

#[inline]
pub(crate) fn set_dispatch_fiber(f: *const Fiber) {
    DISPATCH_FIBER.with(|c| c.set(f));
}

#[inline]
pub(crate) fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().clone())
}

#[inline]
pub(crate) fn set_current_scheduler(s: Option<Arc<Scheduler>>) {
    CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = s);
}
