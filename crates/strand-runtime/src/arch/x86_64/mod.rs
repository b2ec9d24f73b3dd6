//! x86_64 context switching
//!
//! Naked-function inline assembly, stable since Rust 1.88.

use crate::arch::SavedRegs;
use std::arch::naked_asm;

/// Seed a fresh fiber context.
///
/// When first switched to, execution begins at the entry trampoline on the
/// fiber's own stack, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory and `stack_top` must be
/// the one-past-the-end address of a live, writable stack mapping.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Keep the top 16-byte aligned: the trampoline's `call` then leaves
    // rsp ≡ 8 (mod 16) at entry_fn entry, as the System V ABI requires.
    let aligned_sp = (stack_top as usize & !0xF) - 16;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function never returns (it terminates by switching away in a
/// terminal state); `ud2` traps if it somehow does.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Swap execution contexts.
///
/// Saves the callee-saved registers of the caller into `old_regs`, loads
/// `new_regs`, and jumps to its saved rip. Returns (to the original
/// caller) when something later switches back into `old_regs`.
///
/// # Safety
///
/// Both pointers must reference valid `SavedRegs`; `new_regs` must hold a
/// context seeded by [`init_context`] or saved by a previous switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut SavedRegs, _new_regs: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new context's resume point
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
