//! Interrupt-flag save/disable/restore.
//!
//! All of these touch `RFLAGS.IF` via `cli`/`sti`/`pushfq` and therefore
//! require a privileged x86-64 context. User-mode callers take a `#GP`.

/// Reads `RFLAGS` (via `pushfq`/`pop`).
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let flags: u64;
    unsafe {
        core::arch::asm!("pushfq; pop {}", out(reg) flags, options(nostack, preserves_flags));
    }
    flags
}

/// Whether the interrupt flag (`RFLAGS.IF`, bit 9) is currently set.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & (1 << 9) != 0
}

#[inline]
fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

#[inline]
fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// RAII scope with interrupts disabled.
///
/// Construction snapshots `IF` and issues `cli` if interrupts were on;
/// drop issues `sti` only in that case, so nesting and use inside interrupt
/// handlers (where `IF` is already clear) both preserve the outer state.
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            disable_interrupts();
        }
        Self { were_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

/// Runs `f` with interrupts disabled, restoring the prior state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}
