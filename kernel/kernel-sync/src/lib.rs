//! # Interrupt-safe kernel synchronization primitives
//!
//! A single-core kernel mostly serializes through the "interrupts are off
//! while mutating" discipline, but every shared structure reachable from
//! both thread context and interrupt context still needs a lock that an
//! interrupt handler can take without deadlocking against itself. This
//! crate provides the two building blocks:
//!
//! - [`SpinLock`]: a ticket-ordered busy-wait mutex with an RAII guard.
//! - [`IrqGuard`]: an RAII scope that disables interrupts and restores the
//!   prior state on drop.
//!
//! [`SpinLock::lock_irq`] couples the two so the critical section can
//! neither be preempted nor re-entered from an interrupt handler.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod irq;
mod spin_lock;

pub use irq::{IrqGuard, interrupts_enabled, without_interrupts};
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
