//! Runtime configuration
//!
//! Two knobs the core reads on every use, so runtime mutation is reflected
//! in subsequent operations:
//!
//! - fiber stack size (`STRAND_FIBER_STACK_SIZE`, bytes, default 1 MiB)
//! - TCP connect timeout (`STRAND_TCP_CONNECT_TIMEOUT_MS`, default 5000;
//!   negative means no timeout)
//!
//! Environment values are read once, lazily; the `set_*` functions change
//! the live values afterwards.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::OnceLock;

use strand_core::env::env_get;

/// Default fiber stack size in bytes
pub const DEFAULT_FIBER_STACK_SIZE: u32 = 1024 * 1024;

/// Default hooked-connect timeout in milliseconds
pub const DEFAULT_TCP_CONNECT_TIMEOUT_MS: i32 = 5000;

static FIBER_STACK_SIZE: AtomicU32 = AtomicU32::new(DEFAULT_FIBER_STACK_SIZE);
static TCP_CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(DEFAULT_TCP_CONNECT_TIMEOUT_MS as i64);

static ENV_SEED: OnceLock<()> = OnceLock::new();

fn seed_from_env() {
    ENV_SEED.get_or_init(|| {
        FIBER_STACK_SIZE.store(
            env_get("STRAND_FIBER_STACK_SIZE", DEFAULT_FIBER_STACK_SIZE),
            Ordering::Relaxed,
        );
        TCP_CONNECT_TIMEOUT_MS.store(
            env_get("STRAND_TCP_CONNECT_TIMEOUT_MS", DEFAULT_TCP_CONNECT_TIMEOUT_MS) as i64,
            Ordering::Relaxed,
        );
    });
}

/// Stack size used for fibers created with `stack_size == 0`
pub fn fiber_stack_size() -> u32 {
    seed_from_env();
    FIBER_STACK_SIZE.load(Ordering::Relaxed)
}

/// Change the default fiber stack size; affects subsequent fiber creation
pub fn set_fiber_stack_size(bytes: u32) {
    seed_from_env();
    FIBER_STACK_SIZE.store(bytes, Ordering::Relaxed);
    tracing::info!(bytes, "fiber stack size changed");
}

/// Timeout applied by the hooked `connect`, `u64::MAX` when disabled
pub fn tcp_connect_timeout_ms() -> u64 {
    seed_from_env();
    let v = TCP_CONNECT_TIMEOUT_MS.load(Ordering::Relaxed);
    if v < 0 {
        u64::MAX
    } else {
        v as u64
    }
}

/// Change the hooked-connect timeout; negative disables it
pub fn set_tcp_connect_timeout_ms(ms: i32) {
    seed_from_env();
    let old = TCP_CONNECT_TIMEOUT_MS.swap(ms as i64, Ordering::Relaxed);
    tracing::info!(old, new = ms, "tcp connect timeout changed");
}
