//! # Page-table nodes
//!
//! One node per paging level: 512 entries, 4096 bytes, page-aligned so the
//! physical address fits the frame bits of the parent entry.

use crate::addresses::ENTRIES_PER_TABLE;
use crate::entry::PageEntry;

/// A 4096-byte-aligned array of 512 entries, one paging level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// An all-zero node; every entry is non-present.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Clears the whole node.
    pub fn clear(&mut self) {
        self.entries = [PageEntry::new(); ENTRIES_PER_TABLE];
    }

    /// Iterate over `(index, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PhysicalAddress;
    use crate::entry::MapFlags;

    #[test]
    fn node_is_page_sized_and_aligned() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }

    #[test]
    fn set_then_get() {
        let mut table = PageTable::zeroed();
        assert!(!table.get(17).present());

        let entry = PageEntry::leaf(PhysicalAddress::new(0x3000), MapFlags::WRITABLE);
        table.set(17, entry);
        assert!(table.get(17).present());
        assert_eq!(table.get(17).frame().as_u64(), 0x3000);

        table.clear();
        assert!(!table.get(17).present());
    }
}
