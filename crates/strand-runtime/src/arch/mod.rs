//! Architecture-specific context switching
//!
//! Each backend provides `init_context` and `context_switch` over the
//! shared [`SavedRegs`] layout. Only the callee-saved register set is
//! saved: switches happen at explicit call sites, so everything else is
//! dead per the C ABI.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64 as current;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64 as current;

/// Callee-saved register snapshot of a suspended fiber.
///
/// Field order is ABI: the switch assembly addresses these by fixed byte
/// offsets (0x00..0x38). Do not reorder.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_regs_layout() {
        // The switch assembly hard-codes these offsets
        assert_eq!(std::mem::size_of::<SavedRegs>(), 64);
        let r = SavedRegs::zeroed();
        let base = &r as *const _ as usize;
        assert_eq!(&r.rip as *const _ as usize - base, 0x08);
        assert_eq!(&r.r15 as *const _ as usize - base, 0x38);
    }
}
