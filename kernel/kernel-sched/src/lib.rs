//! # Preemptive kernel task scheduling
//!
//! A fixed-capacity task registry and a priority-weighted round-robin
//! scheduler, driven entirely from the timer interrupt:
//!
//! ```text
//! timer / int 0x20
//!   └─ timer_interrupt_entry      push GPRs, rdi = frame
//!        └─ preempt_handler       EOI, then
//!             └─ Scheduler::on_timer_interrupt
//!                  tick ── wake sleepers ── reap ── select ── swap frames
//!        ┌─ mov rsp, rax          resume the frame that came back
//!   pop GPRs, iretq
//! ```
//!
//! Context switching is synchronous with the interrupt return: the
//! scheduler swaps saved-frame pointers and the trampoline's `iretq`
//! lands in the chosen task. Voluntary yields raise the same vector in
//! software, so there is exactly one switch path.
//!
//! The scheduler itself is freestanding state that never touches the
//! hardware, which keeps every policy decision (selection, sleeping,
//! termination, reaping) testable on the host; only [`switch`] contains
//! instructions.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod context;
mod registry;
mod scheduler;
mod switch;
mod task;

pub use context::{
    INITIAL_RFLAGS, InterruptReturnFrame, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR,
    SavedRegisters, TrapFrame,
};
pub use registry::{CreateError, MAX_TASKS, TaskRegistry};
pub use scheduler::{SCHEDULER, Scheduler, SchedulerCell, TICK_HZ};
pub use switch::{
    TIMER_VECTOR, exit_current, idle_main, sleep, task_return_trap, timer_interrupt_entry,
    yield_now,
};
pub use task::{IDLE_PRIORITY, Priority, STACK_SIZE, TaskEntry, TaskId, TaskState, Tcb};
