//! # strand — stackful fibers over a non-blocking reactor
//!
//! A user-space concurrency runtime: application code written in a
//! straight-line, blocking style runs as stackful *fibers* cooperatively
//! multiplexed N:M over a fixed worker-thread pool, while the hooked I/O
//! and sleep primitives quietly turn blocking calls into fiber
//! suspensions driven by an edge-triggered epoll reactor.
//!
//! ## Quick start
//!
//! ```ignore
//! use strand::{hook, IoManager};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "app").unwrap();
//!
//!     iom.spawn(|| {
//!         // Looks blocking; parks the fiber, not the thread
//!         hook::sleep(1);
//!         println!("one second later, cheaply");
//!     });
//!
//!     iom.spawn(|| {
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // hook::connect / hook::send / hook::recv ...
//!         hook::close(fd);
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       application fibers                   │
//! │        straight-line code · hook::read/write/sleep         │
//! └────────────────────────────────────────────────────────────┘
//!                │ would-block: arm + yield
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │   IoManager = Scheduler + TimerManager + epoll reactor     │
//! │   FdContext table · self-pipe tickle · idle fiber          │
//! └────────────────────────────────────────────────────────────┘
//!        │                  │                    │
//!        ▼                  ▼                    ▼
//!  ┌──────────┐      ┌──────────┐         ┌──────────┐
//!  │  worker  │      │  worker  │   ...   │  worker  │
//!  │  thread  │      │  thread  │         │  thread  │
//!  └──────────┘      └──────────┘         └──────────┘
//! ```

// Core types
pub use strand_core::{
    is_hook_enable, set_hook_enable, set_thread_hook_enable, FiberId, FiberState, Result,
    RuntimeError,
};

// Fibers and scheduling
pub use strand_runtime::{config, Fiber, ReactorHooks, Scheduler, Task, ANY_THREAD};

// Reactor, timers, fd table, hooks
pub use strand_io::{fd_table, Event, FdInfo, FdTable, IoManager, TimeoutKind, Timer, TimerManager};

/// The syscall interception layer, re-exported as a module
pub use strand_io::hook;

/// Yield the current fiber, asking to be re-queued immediately
#[inline]
pub fn yield_ready() {
    Fiber::yield_to_ready();
}

/// Yield the current fiber without re-queueing it
#[inline]
pub fn yield_hold() {
    Fiber::yield_to_hold();
}
