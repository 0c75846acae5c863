//! # Task control blocks
//!
//! One [`Tcb`] per schedulable unit. The registry owns the block and its
//! stack for the task's whole lifetime; nothing else ever holds one.

use crate::context::TrapFrame;
use crate::switch::task_return_trap;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

/// Entry point of a kernel task. Must never return; a defensive return
/// trap underneath the initial frame catches it anyway.
pub type TaskEntry = extern "C" fn() -> !;

/// Scheduling weight; higher wins. Zero is the idle task's.
pub type Priority = u8;

/// The idle task's priority; real tasks use 1 and above.
pub const IDLE_PRIORITY: Priority = 0;

/// Size of each task's kernel stack.
pub const STACK_SIZE: usize = 16 * 1024;

const STACK_WORDS: usize = STACK_SIZE / 8;

/// Stable task handle; the registry slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

impl TaskId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state machine. `Terminated` is absorbing; the slot is
/// reclaimed by a later reap once the task is off its own stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

pub struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) priority: Priority,
    /// Saved context; points into this task's own stack.
    pub(crate) frame: *mut TrapFrame,
    /// Exclusively owned stack, kept alive as long as the block.
    #[allow(dead_code)]
    stack: Box<[u64]>,
    pub(crate) cpu_ticks: u64,
    pub(crate) created_at: u64,
    pub(crate) wake_at: u64,
    pub(crate) parent: Option<TaskId>,
    pub(crate) exit_code: Option<i32>,
}

// Safety: the frame pointer targets the exclusively owned stack; the
// registry is the only place a block lives, so moving it across threads
// moves the stack ownership along.
unsafe impl Send for Tcb {}

const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

impl Tcb {
    /// Allocates the stack and synthesizes the initial saved context,
    /// written downward from the stack top (aligned down to 16 bytes;
    /// the allocation itself only guarantees word alignment): first a
    /// return trap for an entry function that returns, then the exact
    /// [`TrapFrame`] the switch path pops.
    pub(crate) fn new(
        id: TaskId,
        name: &str,
        entry: TaskEntry,
        priority: Priority,
        created_at: u64,
        parent: Option<TaskId>,
    ) -> Self {
        let mut stack = vec![0_u64; STACK_WORDS].into_boxed_slice();

        let base = stack.as_mut_ptr() as u64;
        let top = align_down(base + STACK_SIZE as u64, 16);
        let return_slot = top - 8;
        let frame_ptr = (return_slot - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame;
        // Safety: both writes land inside the freshly allocated stack.
        unsafe {
            (return_slot as *mut u64).write(task_return_trap as usize as u64);
            frame_ptr.write(TrapFrame::initial(entry as usize as u64, return_slot));
        }

        Self {
            id,
            name: String::from(name),
            state: TaskState::Ready,
            priority,
            frame: frame_ptr,
            stack,
            cpu_ticks: 0,
            created_at,
            wake_at: 0,
            parent,
            exit_code: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.state
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Cumulative timer ticks spent as the running task.
    #[must_use]
    pub const fn cpu_ticks(&self) -> u64 {
        self.cpu_ticks
    }

    /// Global tick at which the task was created.
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub const fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The saved context the switch path resumes from.
    #[must_use]
    pub const fn frame_ptr(&self) -> *mut TrapFrame {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{INITIAL_RFLAGS, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

    extern "C" fn spin_forever() -> ! {
        loop {
            std::hint::spin_loop();
        }
    }

    #[test]
    fn initial_frame_sits_at_the_stack_top() {
        let tcb = Tcb::new(TaskId(3), "worker", spin_forever, 5, 17, Some(TaskId(0)));
        assert_eq!(tcb.id(), TaskId(3));
        assert_eq!(tcb.name(), "worker");
        assert_eq!(tcb.state(), TaskState::Ready);
        assert_eq!(tcb.priority(), 5);
        assert_eq!(tcb.created_at(), 17);
        assert_eq!(tcb.parent(), Some(TaskId(0)));
        assert_eq!(tcb.cpu_ticks(), 0);
        assert_eq!(tcb.exit_code(), None);

        let frame = unsafe { &*tcb.frame_ptr() };
        assert_eq!(frame.iret.rip, spin_forever as usize as u64);
        assert_eq!(frame.iret.rflags, INITIAL_RFLAGS);
        assert_eq!(frame.iret.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(frame.iret.ss, KERNEL_DATA_SELECTOR);
        // stack pointer lands just past the frame, 8 below the aligned top
        assert_eq!(
            frame.iret.rsp,
            tcb.frame_ptr() as u64 + core::mem::size_of::<TrapFrame>() as u64
        );
        assert_eq!(frame.regs.rbp, frame.iret.rsp);
        assert_eq!(frame.iret.rsp % 16, 8);
        // the word above the entry stack pointer is the return trap
        let return_trap = unsafe { *(frame.iret.rsp as *const u64) };
        assert_eq!(return_trap, crate::switch::task_return_trap as usize as u64);
    }
}
