//! # Page-fault error-code decoding
//!
//! The CPU pushes a 64-bit error code on the page-fault vector; only the
//! low bits carry information. [`PageFaultCode::explain`] turns the common
//! combinations into a diagnostic string for the unrecoverable path.

use bitfield_struct::bitfield;

/// The page-fault error code as pushed by the CPU.
#[bitfield(u64)]
pub struct PageFaultCode {
    /// Clear: the translation was not present. Set: protection violation
    /// on a present translation.
    pub protection_violation: bool,

    /// The faulting access was a write.
    pub write: bool,

    /// The fault originated in user mode (CPL 3).
    pub user: bool,

    /// A hardware-reserved bit was set in a walked entry.
    pub malformed_entry: bool,

    /// The fault was an instruction fetch.
    pub instruction_fetch: bool,

    #[bits(59)]
    __: u64,
}

impl PageFaultCode {
    /// Short human-readable cause, for the unrecoverable-fault report.
    #[must_use]
    pub const fn explain(self) -> &'static str {
        if self.malformed_entry() {
            "reserved bit set in page-table entry"
        } else if self.instruction_fetch() {
            "instruction fetch from non-executable or unmapped page"
        } else if self.protection_violation() {
            if self.write() {
                "write to a present, non-writable page"
            } else {
                "access violation on a present page"
            }
        } else if self.write() {
            "write to unmapped page"
        } else {
            "read from unmapped page"
        }
    }

    /// Whether the fault hit a non-present translation, the only class the
    /// demand path may complete.
    #[must_use]
    pub const fn is_non_present(self) -> bool {
        !self.protection_violation() && !self.malformed_entry()
    }
}

/// Stops the processor with interrupts disabled. Final destination of
/// every unrecoverable fault; there is no isolation to unwind to.
pub fn halt() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli; hlt", options(nomem, nostack));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_common_causes() {
        let read_unmapped = PageFaultCode::new();
        assert!(read_unmapped.is_non_present());
        assert_eq!(read_unmapped.explain(), "read from unmapped page");

        let write_unmapped = PageFaultCode::new().with_write(true);
        assert!(write_unmapped.is_non_present());
        assert_eq!(write_unmapped.explain(), "write to unmapped page");

        let write_protect = PageFaultCode::new()
            .with_protection_violation(true)
            .with_write(true);
        assert!(!write_protect.is_non_present());
        assert_eq!(write_protect.explain(), "write to a present, non-writable page");

        let malformed = PageFaultCode::new().with_malformed_entry(true);
        assert!(!malformed.is_non_present());
        assert_eq!(malformed.explain(), "reserved bit set in page-table entry");
    }
}
