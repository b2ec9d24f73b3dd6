//! # strand-runtime
//!
//! Stackful fibers and the N:M scheduler.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Scheduler (run loop)                  │
//! │   shared FIFO of tasks · per-worker dispatch · idle hook  │
//! └───────────────────────────────────────────────────────────┘
//!        │ resume / yield                      ▲ ReactorHooks
//!        ▼                                     │ (strand-io)
//! ┌───────────────────┐   context_switch   ┌───────────────────┐
//! │       Fiber       │ ◄────────────────► │  dispatch / root  │
//! │  own mmap'd stack │     (arch asm)     │       fiber       │
//! └───────────────────┘                    └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `arch` - register snapshot + naked-asm context switch
//! - `stack` - guard-paged mmap stacks
//! - `fiber` - the fiber state machine and trampoline
//! - `scheduler` - worker pool, task queue, dispatch loop
//! - `config` - runtime-mutable knobs seeded from the environment
//! - `tls` - per-thread anchors (current/root/dispatch fiber, scheduler)

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod stack;
pub(crate) mod tls;

pub use fiber::Fiber;
pub use scheduler::{ReactorHooks, Scheduler, Task, ANY_THREAD};
