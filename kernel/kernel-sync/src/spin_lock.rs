use crate::IrqGuard;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// A ticket-ordered busy-wait mutex.
///
/// Acquisition takes a ticket and spins until the serving counter reaches
/// it, so waiters are granted the lock in arrival order (no starvation
/// under contention). Release bumps the serving counter.
///
/// Hold times must be short and the lock must never be held across a
/// suspension point; in interrupt context, pair it with [`IrqGuard`] via
/// [`lock_irq`](Self::lock_irq) so the holder cannot be preempted.
pub struct SpinLock<T> {
    /// Next ticket to hand out.
    next: AtomicU32,
    /// Ticket currently being served.
    serving: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: the ticket discipline guarantees mutual exclusion; only T: Send
// may be accessed from multiple threads through the lock.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            next: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Spin until the lock is acquired, then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Try once; `None` if anyone currently holds or awaits the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Run `f` under the lock, releasing it afterwards.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Disable interrupts, then acquire.
    ///
    /// The returned guard restores the previous interrupt state after the
    /// lock is released. This is the only safe acquisition order for locks
    /// shared with interrupt handlers: taking the lock first would open a
    /// window where the handler spins on a lock its own interruptee holds.
    ///
    /// Requires a privileged x86-64 context (`cli`/`sti` must be legal).
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { _irq: irq, guard }
    }

    /// Exclusive access through `&mut self`; no locking needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section to the next ticket holder.
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}

/// A [`SpinLockGuard`] that also keeps interrupts disabled while held.
///
/// Field order matters: the lock guard drops (releasing the lock) before
/// the interrupt state is restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
