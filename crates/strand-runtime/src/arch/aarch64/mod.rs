//! aarch64 context switching
//!
//! TODO: port the x86_64 switch (x19-x28, fp, lr, sp save set) for Linux
//! ARM and Apple Silicon.

use crate::arch::SavedRegs;

/// Seed a fresh fiber context
pub unsafe fn init_context(
    _regs: *mut SavedRegs,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Swap execution contexts
pub unsafe extern "C" fn context_switch(_old_regs: *mut SavedRegs, _new_regs: *const SavedRegs) {
    todo!("aarch64 context_switch not yet implemented")
}
