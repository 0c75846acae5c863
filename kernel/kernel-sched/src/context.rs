//! # The trap-frame layout
//!
//! There is exactly one binary layout for saved CPU state, defined here
//! and consumed by both the initial-context constructor and the low-level
//! switch path in [`switch`](crate::switch). A brand-new task's first
//! resume therefore runs the identical pop-and-`iretq` sequence as
//! resuming a preempted one.
//!
//! Memory order (lowest address first) matches the push sequence of the
//! interrupt trampoline: the fifteen general-purpose registers, then the
//! five-word frame the CPU itself pushed.

/// Kernel code segment selector (GDT entry 1).
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;

/// Kernel data segment selector (GDT entry 2).
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// RFLAGS for a fresh task: interrupts enabled, mandatory bit 1 set.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// General-purpose registers as pushed by the interrupt trampoline.
///
/// Field order is memory order; `r15` sits at the lowest address because
/// it is pushed last.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// The five words the CPU pushes on an interrupt from ring 0 and pops on
/// `iretq`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptReturnFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Complete saved context: what the stack looks like at the moment the
/// trampoline hands control to the scheduler.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub regs: SavedRegisters,
    pub iret: InterruptReturnFrame,
}

impl TrapFrame {
    /// The context a brand-new task resumes from: entry point in `rip`,
    /// interrupts enabled, all general-purpose registers zeroed except
    /// the frame pointer, which is wired just past the trap frame.
    #[must_use]
    pub const fn initial(entry: u64, stack_pointer: u64) -> Self {
        Self {
            regs: SavedRegisters {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                r11: 0,
                r10: 0,
                r9: 0,
                r8: 0,
                rbp: stack_pointer,
                rdi: 0,
                rsi: 0,
                rdx: 0,
                rcx: 0,
                rbx: 0,
                rax: 0,
            },
            iret: InterruptReturnFrame {
                rip: entry,
                cs: KERNEL_CODE_SELECTOR,
                rflags: INITIAL_RFLAGS,
                rsp: stack_pointer,
                ss: KERNEL_DATA_SELECTOR,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_the_push_sequence() {
        // 15 pushed registers + 5 CPU-pushed words
        assert_eq!(core::mem::size_of::<SavedRegisters>(), 15 * 8);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 20 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, iret), 15 * 8);
        // r15 is pushed last, so it must sit at the lowest address
        assert_eq!(core::mem::offset_of!(SavedRegisters, r15), 0);
        assert_eq!(core::mem::offset_of!(SavedRegisters, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(InterruptReturnFrame, rip), 0);
        assert_eq!(core::mem::offset_of!(InterruptReturnFrame, ss), 4 * 8);
    }

    #[test]
    fn initial_context_resumes_at_the_entry_point() {
        let frame = TrapFrame::initial(0xDEAD_0000, 0xCAFE_0000);
        assert_eq!(frame.iret.rip, 0xDEAD_0000);
        assert_eq!(frame.iret.rsp, 0xCAFE_0000);
        assert_eq!(frame.iret.rflags, INITIAL_RFLAGS);
        assert_eq!(frame.iret.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(frame.iret.ss, KERNEL_DATA_SELECTOR);
        assert_eq!(frame.regs.rbp, 0xCAFE_0000);
        assert_eq!(frame.regs.rax, 0);
        assert_eq!(frame.regs.r15, 0);
    }
}
