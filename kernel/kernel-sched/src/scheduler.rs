//! # Priority-weighted round robin
//!
//! The scheduler is an explicit context object; the interrupt glue keeps
//! the one instance in [`SCHEDULER`] and drives it from the timer vector.
//! Selection always performs one full circular scan over the registry
//! starting after the current slot and takes the strictly highest
//! priority seen, first-seen winning ties. Equal-priority tasks therefore
//! rotate fairly, and a lower-priority ready task waits at most one
//! scheduler pass behind higher-priority ones, never unboundedly.

use crate::context::TrapFrame;
use crate::registry::{CreateError, TaskRegistry};
use crate::task::{IDLE_PRIORITY, Priority, TaskEntry, TaskId, TaskState, Tcb};
use alloc::vec::Vec;
use kernel_sync::SpinLock;
use log::{debug, trace, warn};

/// Timer rate the tick conversion assumes: 1000 Hz, one tick per
/// millisecond.
pub const TICK_HZ: u64 = 1000;

pub struct Scheduler {
    registry: TaskRegistry,
    current: Option<TaskId>,
    idle: TaskId,
    ticks: u64,
}

impl Scheduler {
    /// Builds the registry and installs the dedicated idle task (priority
    /// 0, never removed). The boot context becomes the idle task: its
    /// first preemption saves the boot frame there and never resumes it.
    pub fn new(idle_entry: TaskEntry) -> Self {
        let mut registry = TaskRegistry::new();
        let idle = registry
            .insert(|id| Tcb::new(id, "idle", idle_entry, IDLE_PRIORITY, 0, None))
            .expect("empty registry accepts the idle task");
        if let Some(tcb) = registry.get_mut(idle) {
            tcb.state = TaskState::Running;
        }
        Self {
            registry,
            current: Some(idle),
            idle,
            ticks: 0,
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Creates a ready task. The parent is whoever is current; the
    /// creation tick is recorded for bookkeeping.
    pub fn create(
        &mut self,
        name: &str,
        entry: TaskEntry,
        priority: Priority,
    ) -> Result<TaskId, CreateError> {
        let parent = self.current;
        let now = self.ticks;
        let id = self
            .registry
            .insert(|id| Tcb::new(id, name, entry, priority, now, parent))?;
        debug!("created task {id} '{name}' (priority {priority})");
        Ok(id)
    }

    /// Marks `id` terminated and records the exit code. A task
    /// terminating itself must yield afterwards and never runs again;
    /// the slot and stack are reclaimed by a later reap. The idle task
    /// cannot be terminated.
    pub fn terminate(&mut self, id: TaskId, exit_code: i32) {
        if id == self.idle {
            warn!("refusing to terminate the idle task");
            return;
        }
        if let Some(tcb) = self.registry.get_mut(id)
            && tcb.state != TaskState::Terminated
        {
            tcb.state = TaskState::Terminated;
            tcb.exit_code = Some(exit_code);
            trace!("task {id} terminated with exit code {exit_code}");
        }
    }

    /// Puts the current task to sleep until `millis` milliseconds have
    /// ticked by. Silently ignored when no task is current. The deadline
    /// guarantees "not before", not "at": wakeup happens on the first
    /// tick at or after it.
    pub fn sleep_current(&mut self, millis: u64) {
        let deadline = self
            .ticks
            .saturating_add(millis.saturating_mul(TICK_HZ) / 1000);
        if let Some(current) = self.current
            && let Some(tcb) = self.registry.get_mut(current)
            && tcb.state == TaskState::Running
        {
            tcb.state = TaskState::Sleeping;
            tcb.wake_at = deadline;
            trace!("task {current} sleeping until tick {deadline}");
        }
    }

    /// Takes a ready or running task out of scheduling until
    /// [`unblock`](Self::unblock).
    pub fn block(&mut self, id: TaskId) {
        if id == self.idle {
            return;
        }
        if let Some(tcb) = self.registry.get_mut(id)
            && matches!(tcb.state, TaskState::Ready | TaskState::Running)
        {
            tcb.state = TaskState::Blocked;
        }
    }

    /// Makes a blocked task ready again.
    pub fn unblock(&mut self, id: TaskId) {
        if let Some(tcb) = self.registry.get_mut(id)
            && tcb.state == TaskState::Blocked
        {
            tcb.state = TaskState::Ready;
        }
    }

    // ---- the timer path --------------------------------------------------

    /// One timer interrupt: advance the clock, account the running task,
    /// wake due sleepers, reap reapable terminated tasks, then switch.
    /// Returns the frame to resume; `frame` is the interrupted context.
    pub fn on_timer_interrupt(&mut self, frame: *mut TrapFrame) -> *mut TrapFrame {
        self.tick();
        self.reap_terminated();
        self.reschedule(frame)
    }

    /// Advances the global counter, charges the running task, and
    /// promotes every sleeper whose deadline has elapsed.
    pub fn tick(&mut self) {
        self.ticks += 1;
        let now = self.ticks;
        if let Some(current) = self.current
            && let Some(tcb) = self.registry.get_mut(current)
        {
            tcb.cpu_ticks += 1;
        }
        for tcb in self.registry.iter_mut() {
            if tcb.state == TaskState::Sleeping && tcb.wake_at <= now {
                tcb.state = TaskState::Ready;
                trace!("task {} woke at tick {now}", tcb.id);
            }
        }
    }

    /// One full circular scan starting after the current slot; the ready
    /// task with the strictly highest priority wins, first seen wins
    /// ties. Falls back to the idle task when nothing is ready.
    #[must_use]
    pub fn select_next(&self) -> TaskId {
        let slots = self.registry.slot_count();
        let start = self.current.map_or(0, TaskId::index);
        let mut best: Option<(TaskId, Priority)> = None;
        for step in 1..=slots {
            let index = (start + step) % slots;
            let Some(tcb) = self.registry.slot(index) else {
                continue;
            };
            if tcb.state != TaskState::Ready {
                continue;
            }
            match best {
                Some((_, priority)) if tcb.priority <= priority => {}
                _ => best = Some((tcb.id, tcb.priority)),
            }
        }
        best.map_or(self.idle, |(id, _)| id)
    }

    /// Swaps saved-context references: parks the interrupted frame in the
    /// outgoing block, selects, and hands back the incoming frame for the
    /// trampoline to resume. Synchronous with the interrupt return; there
    /// is no scheduler thread.
    fn reschedule(&mut self, frame: *mut TrapFrame) -> *mut TrapFrame {
        if let Some(current) = self.current
            && let Some(tcb) = self.registry.get_mut(current)
        {
            tcb.frame = frame;
            if tcb.state == TaskState::Running {
                tcb.state = TaskState::Ready;
            }
        }

        let next = self.select_next();
        self.current = Some(next);
        let Some(tcb) = self.registry.get_mut(next) else {
            // selection only returns live ids; resume what we came from
            return frame;
        };
        tcb.state = TaskState::Running;
        trace!("switching to task {next}");
        tcb.frame
    }

    /// Returns terminated tasks' slots and stacks to the registry. The
    /// current task is skipped even if terminated: it may still be
    /// executing on its stack until the switch away, so its slot is
    /// reclaimed on the next pass.
    fn reap_terminated(&mut self) {
        let current = self.current;
        let mut reapable: Vec<TaskId> = Vec::new();
        for tcb in self.registry.iter() {
            if tcb.state == TaskState::Terminated && Some(tcb.id) != current {
                reapable.push(tcb.id);
            }
        }
        for id in reapable {
            if let Some(tcb) = self.registry.remove(id) {
                trace!("reaped task {} '{}'", tcb.id, tcb.name);
            }
        }
    }

    // ---- queries ---------------------------------------------------------

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Tcb> {
        self.registry.get(id)
    }

    /// Live tasks, idle included.
    pub fn tasks(&self) -> impl Iterator<Item = &Tcb> {
        self.registry.iter()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    #[must_use]
    pub const fn current_id(&self) -> Option<TaskId> {
        self.current
    }

    #[must_use]
    pub const fn idle_id(&self) -> TaskId {
        self.idle
    }

    /// Global monotonic tick counter; drives uptime and sleep deadlines.
    #[must_use]
    pub const fn uptime_ticks(&self) -> u64 {
        self.ticks
    }
}

/// Explicitly initialized process-wide holder for the one [`Scheduler`].
///
/// The timer trampoline reaches the scheduler through [`SCHEDULER`]; until
/// [`init`](Self::init) runs, [`with`](Self::with) answers `None` and the
/// trampoline resumes the interrupted context unchanged.
///
/// The lock alone does not make access interrupt-safe: every holder must
/// have interrupts suppressed (the trampoline runs behind an interrupt
/// gate; voluntary entry points wrap access in
/// [`kernel_sync::without_interrupts`]), otherwise the timer could spin
/// on a lock its own interruptee holds.
pub struct SchedulerCell {
    inner: SpinLock<Option<Scheduler>>,
}

impl SchedulerCell {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs the scheduler; returns `false` if one is already there.
    pub fn init(&self, scheduler: Scheduler) -> bool {
        self.inner.with_lock(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(scheduler);
            true
        })
    }

    /// Runs `f` against the scheduler; `None` before [`init`](Self::init).
    pub fn with<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
        self.inner.with_lock(|slot| slot.as_mut().map(f))
    }
}

impl Default for SchedulerCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide scheduler instance the interrupt glue drives.
pub static SCHEDULER: SchedulerCell = SchedulerCell::new();

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn spin_forever() -> ! {
        loop {
            std::hint::spin_loop();
        }
    }

    fn sched() -> Scheduler {
        Scheduler::new(spin_forever)
    }

    /// Drives one timer interrupt with a throwaway interrupted frame and
    /// reports who got selected.
    fn advance(s: &mut Scheduler, boot: &mut TrapFrame) -> TaskId {
        s.on_timer_interrupt(core::ptr::from_mut(boot));
        s.current_id().unwrap()
    }

    #[test]
    fn idle_task_is_installed_and_current() {
        let s = sched();
        assert_eq!(s.count(), 1);
        assert_eq!(s.current_id(), Some(s.idle_id()));
        assert_eq!(s.task(s.idle_id()).unwrap().priority(), IDLE_PRIORITY);
        assert_eq!(s.uptime_ticks(), 0);
    }

    #[test]
    fn six_ticks_alternate_between_the_equal_priority_pair() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let b = s.create("b", spin_forever, 5).unwrap();
        let c = s.create("c", spin_forever, 1).unwrap();

        let mut boot = TrapFrame::default();
        let picks: Vec<TaskId> = (0..6).map(|_| advance(&mut s, &mut boot)).collect();
        assert_eq!(picks, [a, b, a, b, a, b]);
        assert_eq!(s.task(c).unwrap().state(), TaskState::Ready);
        assert_eq!(s.task(c).unwrap().cpu_ticks(), 0);
    }

    #[test]
    fn equal_priorities_rotate_fairly() {
        let mut s = sched();
        let ids: Vec<TaskId> = (0..4)
            .map(|i| {
                let name = format!("t{i}");
                s.create(&name, spin_forever, 3).unwrap()
            })
            .collect();

        let mut boot = TrapFrame::default();
        for round in 0..3 {
            let mut seen: Vec<TaskId> = (0..ids.len())
                .map(|_| advance(&mut s, &mut boot))
                .collect();
            seen.sort_unstable();
            assert_eq!(seen, ids, "round {round} must visit every task once");
        }
    }

    #[test]
    fn strictly_highest_priority_always_wins() {
        let mut s = sched();
        let low = s.create("low", spin_forever, 1).unwrap();
        let mid_a = s.create("mid-a", spin_forever, 5).unwrap();
        let mid_b = s.create("mid-b", spin_forever, 5).unwrap();
        let top = s.create("top", spin_forever, 10).unwrap();

        let mut boot = TrapFrame::default();
        for _ in 0..5 {
            assert_eq!(advance(&mut s, &mut boot), top);
        }

        // with the top task gone, the two fives alternate; one never wins
        s.terminate(top, 0);
        let first = advance(&mut s, &mut boot);
        let second = advance(&mut s, &mut boot);
        let third = advance(&mut s, &mut boot);
        assert_eq!(first, mid_a);
        assert_eq!(second, mid_b);
        assert_eq!(third, mid_a);
        assert_eq!(s.task(low).unwrap().cpu_ticks(), 0);
    }

    #[test]
    fn sleeping_task_wakes_exactly_at_the_deadline() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let b = s.create("b", spin_forever, 5).unwrap();

        let mut boot = TrapFrame::default();
        assert_eq!(advance(&mut s, &mut boot), a); // tick 1
        assert_eq!(advance(&mut s, &mut boot), b); // tick 2

        // b (current) sleeps 3 ticks at T=2; deadline is 5
        s.sleep_current(3);
        assert_eq!(s.task(b).unwrap().state(), TaskState::Sleeping);

        assert_eq!(advance(&mut s, &mut boot), a); // tick 3
        assert_eq!(s.task(b).unwrap().state(), TaskState::Sleeping);
        assert_eq!(advance(&mut s, &mut boot), a); // tick 4
        assert_eq!(s.task(b).unwrap().state(), TaskState::Sleeping);

        // tick 5 reaches the deadline; b is ready again and gets picked
        assert_eq!(advance(&mut s, &mut boot), b);
    }

    #[test]
    fn sleep_with_huge_duration_saturates_instead_of_overflowing() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();

        let mut boot = TrapFrame::default();
        assert_eq!(advance(&mut s, &mut boot), a);

        s.sleep_current(u64::MAX);
        assert_eq!(s.task(a).unwrap().state(), TaskState::Sleeping);
        for _ in 0..3 {
            assert_eq!(advance(&mut s, &mut boot), s.idle_id());
        }
        assert_eq!(s.task(a).unwrap().state(), TaskState::Sleeping);
    }

    #[test]
    fn idle_runs_when_everyone_sleeps() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();

        let mut boot = TrapFrame::default();
        assert_eq!(advance(&mut s, &mut boot), a);
        s.sleep_current(10);
        assert_eq!(advance(&mut s, &mut boot), s.idle_id());
    }

    #[test]
    fn terminated_tasks_are_reaped_and_slots_reused() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();

        let mut boot = TrapFrame::default();
        assert_eq!(advance(&mut s, &mut boot), a);

        // a terminates itself; it stays current until the switch away
        s.terminate(a, 42);
        assert_eq!(s.task(a).unwrap().state(), TaskState::Terminated);
        assert_eq!(s.task(a).unwrap().exit_code(), Some(42));

        // first interrupt switches away (current, not yet reapable)
        assert_eq!(advance(&mut s, &mut boot), s.idle_id());
        // second interrupt reaps the slot
        let _ = advance(&mut s, &mut boot);
        assert!(s.task(a).is_none());
        assert_eq!(s.count(), 1);

        // the slot comes back through the free-list
        let reused = s.create("fresh", spin_forever, 5).unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn terminate_is_idempotent_and_spares_idle() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();

        s.terminate(a, 1);
        s.terminate(a, 2);
        assert_eq!(s.task(a).unwrap().exit_code(), Some(1));

        s.terminate(s.idle_id(), 0);
        assert_ne!(s.task(s.idle_id()).unwrap().state(), TaskState::Terminated);
    }

    #[test]
    fn blocked_tasks_are_skipped_until_unblocked() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let b = s.create("b", spin_forever, 5).unwrap();

        s.block(a);
        let mut boot = TrapFrame::default();
        assert_eq!(advance(&mut s, &mut boot), b);
        assert_eq!(advance(&mut s, &mut boot), b);

        s.unblock(a);
        assert_eq!(advance(&mut s, &mut boot), a);
    }

    #[test]
    fn running_task_accumulates_cpu_ticks() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let b = s.create("b", spin_forever, 2).unwrap();

        let mut boot = TrapFrame::default();
        for _ in 0..4 {
            let _ = advance(&mut s, &mut boot);
        }
        // a has been current for ticks 2..=4 (the first tick charges the
        // boot/idle context)
        assert_eq!(s.task(a).unwrap().cpu_ticks(), 3);
        assert_eq!(s.task(b).unwrap().cpu_ticks(), 0);
        assert_eq!(s.uptime_ticks(), 4);
    }

    #[test]
    fn reschedule_swaps_saved_context_references() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let a_frame = s.task(a).unwrap().frame_ptr();

        let mut boot = TrapFrame::default();
        let boot_ptr = core::ptr::from_mut(&mut boot);
        let resumed = s.on_timer_interrupt(boot_ptr);

        // the incoming frame is a's initial context; the interrupted one
        // was parked in the outgoing (idle) block
        assert_eq!(resumed, a_frame);
        assert_eq!(s.task(s.idle_id()).unwrap().frame_ptr(), boot_ptr);
        assert_eq!(s.task(a).unwrap().state(), TaskState::Running);
        assert_eq!(s.task(s.idle_id()).unwrap().state(), TaskState::Ready);
    }

    #[test]
    fn creation_records_parent_and_tick() {
        let mut s = sched();
        let mut boot = TrapFrame::default();
        let _ = advance(&mut s, &mut boot);
        let _ = advance(&mut s, &mut boot);

        let a = s.create("child", spin_forever, 4).unwrap();
        let tcb = s.task(a).unwrap();
        assert_eq!(tcb.created_at(), 2);
        assert_eq!(tcb.parent(), s.current_id());
        assert_eq!(tcb.name(), "child");
    }

    #[test]
    fn enumeration_sees_every_live_task() {
        let mut s = sched();
        let a = s.create("a", spin_forever, 5).unwrap();
        let b = s.create("b", spin_forever, 6).unwrap();

        let mut ids: Vec<TaskId> = s.tasks().map(Tcb::id).collect();
        ids.sort_unstable();
        assert_eq!(ids, [s.idle_id(), a, b]);
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn cell_initializes_once_and_threads_access() {
        let cell = SchedulerCell::new();
        assert!(cell.with(|_| ()).is_none());
        assert!(cell.init(sched()));
        assert!(!cell.init(sched()));

        let count = cell
            .with(|s| {
                s.create("in-cell", spin_forever, 3).unwrap();
                s.count()
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
