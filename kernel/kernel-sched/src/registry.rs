//! # The task registry
//!
//! An arena of slots indexed by [`TaskId`]: insertion is O(1) through a
//! free-list of reclaimed slots, and the round-robin scan walks the slot
//! array directly. A terminated task's slot (and its stack) is handed
//! back by the scheduler's reap, so the arena does not grow monotonically.

use crate::task::{Tcb, TaskId};
use alloc::vec::Vec;

/// Hard cap on simultaneously live tasks.
pub const MAX_TASKS: usize = 64;

/// Why a task could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    #[error("task registry is full ({MAX_TASKS} slots)")]
    RegistryFull,
}

pub struct TaskRegistry {
    slots: Vec<Option<Tcb>>,
    free: Vec<u32>,
}

impl TaskRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Claims a slot and builds the block in place; the builder receives
    /// the id the block will carry.
    pub fn insert(
        &mut self,
        build: impl FnOnce(TaskId) -> Tcb,
    ) -> Result<TaskId, CreateError> {
        let index = if let Some(index) = self.free.pop() {
            index
        } else if self.slots.len() < MAX_TASKS {
            self.slots.push(None);
            (self.slots.len() - 1) as u32
        } else {
            return Err(CreateError::RegistryFull);
        };

        let id = TaskId(index);
        self.slots[index as usize] = Some(build(id));
        Ok(id)
    }

    /// Takes the block out and recycles the slot.
    pub fn remove(&mut self, id: TaskId) -> Option<Tcb> {
        let tcb = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        Some(tcb)
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&Tcb> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Number of live tasks.
    #[must_use]
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of slots the circular scan covers (live or vacant).
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The block in slot `index`, if the slot is occupied.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&Tcb> {
        self.slots.get(index)?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tcb> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    extern "C" fn spin_forever() -> ! {
        loop {
            std::hint::spin_loop();
        }
    }

    fn block(id: TaskId) -> Tcb {
        Tcb::new(id, "t", spin_forever, 1, 0, None)
    }

    #[test]
    fn insert_assigns_sequential_slots() {
        let mut registry = TaskRegistry::new();
        let a = registry.insert(block).unwrap();
        let b = registry.insert(block).unwrap();
        assert_eq!(a, TaskId(0));
        assert_eq!(b, TaskId(1));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get(a).unwrap().state(), TaskState::Ready);
    }

    #[test]
    fn removed_slots_are_recycled() {
        let mut registry = TaskRegistry::new();
        let a = registry.insert(block).unwrap();
        let _b = registry.insert(block).unwrap();

        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert_eq!(registry.count(), 1);

        // the freed slot is reused, id included
        let c = registry.insert(block).unwrap();
        assert_eq!(c, a);
        assert_eq!(registry.slot_count(), 2);

        // double remove is a no-op
        assert!(registry.remove(TaskId(7)).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let mut registry = TaskRegistry::new();
        for _ in 0..MAX_TASKS {
            registry.insert(block).unwrap();
        }
        assert_eq!(registry.insert(block), Err(CreateError::RegistryFull));
    }
}
