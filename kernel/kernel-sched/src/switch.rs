//! # The context-switch path
//!
//! There is exactly one switch mechanism: the timer interrupt trampoline.
//! It pushes the fifteen general-purpose registers on top of the CPU's
//! interrupt frame (forming a [`TrapFrame`]), hands the frame pointer to
//! the scheduler, and resumes whatever frame comes back with the same
//! pop-and-`iretq` tail. Voluntary yields fire a software interrupt at
//! the very same vector, so cooperative and preemptive switches share one
//! code path and the tick clock never stalls.

use crate::context::TrapFrame;
use crate::scheduler::SCHEDULER;
use kernel_sync::without_interrupts;

/// IDT vector the timer fires on; [`yield_now`] raises it in software.
pub const TIMER_VECTOR: u8 = 0x20;

const PIC_COMMAND_PORT: u16 = 0x20;
const PIC_EOI: u8 = 0x20;
const PIC_READ_ISR: u8 = 0x0b;

/// The interrupt entry to install at [`TIMER_VECTOR`] (interrupt gate, so
/// the whole path runs with interrupts off).
///
/// Push order is the reverse of [`SavedRegisters`](crate::context::SavedRegisters)
/// field order: `rax` first, `r15` last, leaving `r15` at the lowest
/// address. Interrupt delivery aligns `rsp` to 16, and the 5 + 15 pushed
/// words keep it 16-aligned at the `call`, so no parity fixup is needed.
/// The handler returns the frame to resume in `rax`; loading it into
/// `rsp` is what actually switches tasks.
#[unsafe(naked)]
pub extern "C" fn timer_interrupt_entry() {
    core::arch::naked_asm!(
        "cld",
        "push rax", "push rbx", "push rcx", "push rdx", "push rsi", "push rdi", "push rbp",
        "push r8", "push r9", "push r10", "push r11", "push r12", "push r13", "push r14", "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "mov rsp, rax",
        "pop r15", "pop r14", "pop r13", "pop r12", "pop r11", "pop r10", "pop r9", "pop r8",
        "pop rbp", "pop rdi", "pop rsi", "pop rdx", "pop rcx", "pop rbx", "pop rax",
        "iretq",
        handler = sym preempt_handler,
    )
}

/// Rust half of the timer path: acknowledge the interrupt, then let the
/// scheduler pick. Before [`SCHEDULER`] is initialized the interrupted
/// frame is resumed unchanged.
///
/// A software [`yield_now`] walks the same gate without going through the
/// PIC, so the acknowledgement is gated on the in-service register: a
/// non-specific EOI with a different IRQ in service would retire that one
/// instead.
extern "C" fn preempt_handler(frame: *mut TrapFrame) -> *mut TrapFrame {
    // Safety: we are inside the interrupt gate this vector dispatches to.
    unsafe {
        if timer_in_service() {
            end_of_interrupt();
        }
    }
    SCHEDULER
        .with(|scheduler| scheduler.on_timer_interrupt(frame))
        .unwrap_or(frame)
}

/// Whether IRQ 0 is currently in service at the primary PIC.
///
/// # Safety
///
/// Requires a privileged context; issues an OCW3 read to the PIC command
/// port.
unsafe fn timer_in_service() -> bool {
    let isr: u8;
    unsafe {
        core::arch::asm!(
            "out dx, al",
            "in al, dx",
            in("dx") PIC_COMMAND_PORT,
            inout("al") PIC_READ_ISR => isr,
            options(nomem, nostack, preserves_flags),
        );
    }
    isr & 1 != 0
}

/// Signals end-of-interrupt to the primary PIC.
///
/// # Safety
///
/// Must only be called while servicing an interrupt the PIC delivered;
/// a stray acknowledgement can drop a pending interrupt.
unsafe fn end_of_interrupt() {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") PIC_COMMAND_PORT,
            in("al") PIC_EOI,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Gives up the rest of the current time slice by raising the timer
/// vector in software. Control returns here once the scheduler picks
/// this task again.
pub fn yield_now() {
    // Safety: the software interrupt walks the same gate as the hardware
    // timer; the trampoline preserves all registers.
    unsafe {
        core::arch::asm!("int {vector}", vector = const TIMER_VECTOR);
    }
}

/// Puts the current task to sleep for at least `millis` milliseconds,
/// then yields. Wakeup is "not before": the task becomes ready on the
/// first tick at or after the deadline and runs when next selected.
pub fn sleep(millis: u64) {
    without_interrupts(|| {
        SCHEDULER.with(|scheduler| scheduler.sleep_current(millis));
    });
    yield_now();
}

/// Terminates the calling task. The task keeps running on its own stack
/// until the yield switches away; the slot and stack are reclaimed by a
/// later reap, never while we still stand on it.
pub fn exit_current(exit_code: i32) -> ! {
    without_interrupts(|| {
        SCHEDULER.with(|scheduler| {
            if let Some(current) = scheduler.current_id() {
                scheduler.terminate(current, exit_code);
            }
        });
    });
    loop {
        // a terminated task is never selected again
        yield_now();
    }
}

/// Landing pad for a task entry that returns despite its signature.
/// Sits one word above the initial stack pointer so a stray `ret` ends
/// the task cleanly instead of running off the stack.
pub extern "C" fn task_return_trap() -> ! {
    exit_current(0);
}

/// The idle task body: halt until the next interrupt, forever. The boot
/// context turns into this task at its first preemption.
pub extern "C" fn idle_main() -> ! {
    loop {
        // Safety: re-enable interrupts and wait; the timer wakes us.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack));
        }
    }
}
