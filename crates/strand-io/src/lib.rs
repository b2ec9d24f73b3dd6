//! # strand-io
//!
//! The I/O side of the strand runtime: deadline-ordered timers, the epoll
//! reactor extending the scheduler, per-fd metadata, and the syscall hook
//! layer that turns blocking-style calls into fiber suspensions.
//!
//! ```text
//!  application fiber ── hook::read() ──► would-block?
//!        ▲                                   │ add_event + yield
//!        │ resume                            ▼
//!  Scheduler queue ◄── trigger ◄── IoManager idle (epoll_wait)
//!                                      ▲
//!                 timers ── expired ───┘
//! ```
//!
//! ## Modules
//!
//! - `timer` - Timer / TimerManager (deadline set, rollover defense)
//! - `reactor` - IoManager: epoll, FdContext table, self-pipe, idle loop
//! - `fd_table` - FdInfo / FdTable singleton (socket-ness, nonblock bits,
//!   per-direction timeouts)
//! - `hook` - blocking-style wrappers over the POSIX primitives

pub mod fd_table;
pub mod hook;
pub mod reactor;
pub mod timer;

pub use fd_table::{fd_table, FdInfo, FdTable, TimeoutKind};
pub use reactor::{Event, IoManager};
pub use timer::{Timer, TimerManager};
