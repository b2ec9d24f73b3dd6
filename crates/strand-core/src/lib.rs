//! # strand-core
//!
//! Shared types for the strand fiber runtime.
//!
//! This crate carries the pieces every other strand crate needs: the fiber
//! id and state machine, the error enum, errno/clock/thread-id helpers, env
//! parsing for configuration seeding, and the hook enablement flags. It has
//! no scheduling or I/O logic of its own.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state enum and atomic state cell
//! - `error` - Error types
//! - `os` - thread id, wall-clock ms, errno access
//! - `env` - Environment variable parsing utilities
//! - `hook_flag` - Process-wide and per-thread hook switches

pub mod env;
pub mod error;
pub mod hook_flag;
pub mod id;
pub mod os;
pub mod state;

pub use error::{Result, RuntimeError};
pub use hook_flag::{is_hook_enable, set_hook_enable, set_thread_hook_enable};
pub use id::FiberId;
pub use state::{FiberState, StateCell};
