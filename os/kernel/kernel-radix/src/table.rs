//! Views of radix tables living in physical memory.
//!
//! A table is an array of big-endian 64-bit words that the hardware walker
//! reads concurrently with us. All access goes through atomics. The
//! endianness conversion happens here and nowhere else.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addresses::PhysicalAddress;
use crate::phys::PhysicalMemoryView;
use crate::pte::RadixEntry;

/// A table of radix entries.
#[derive(Copy, Clone)]
pub(crate) struct Table<'a> {
    pa: PhysicalAddress,
    entries: &'a [AtomicU64],
}

/// One entry inside a [`Table`].
#[derive(Copy, Clone)]
pub(crate) struct PteSlot<'a> {
    cell: &'a AtomicU64,
}

impl<'a> Table<'a> {
    /// View the `len`-entry table at `pa`.
    ///
    /// Panics if `pa` is outside the memory view or misaligned: a table
    /// pointer like that means the tree is corrupt.
    pub(crate) fn at<V: PhysicalMemoryView>(view: &'a V, pa: PhysicalAddress, len: usize) -> Self {
        assert!(
            pa.as_u64() & (crate::PAGE_SIZE - 1) == 0,
            "corrupt radix table pointer {pa}"
        );
        // Safety: the range is checked by `words`; table pages are only
        // ever accessed through atomics.
        let entries = unsafe { view.words(pa, len) };
        Self { pa, entries }
    }

    #[inline]
    pub(crate) const fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> PteSlot<'a> {
        PteSlot {
            cell: &self.entries[index],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entry is valid.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .all(|e| !RadixEntry::decode(u64::from_be(e.load(Ordering::Relaxed))).is_valid())
    }

    /// Physical address of the table page referenced by each valid
    /// non-leaf entry.
    pub(crate) fn children(&self) -> impl Iterator<Item = PhysicalAddress> + 'a {
        self.entries.iter().filter_map(|e| {
            match RadixEntry::decode(u64::from_be(e.load(Ordering::Acquire))) {
                RadixEntry::Table(pa) => Some(pa),
                _ => None,
            }
        })
    }
}

impl PteSlot<'_> {
    /// Current value in host order.
    #[inline]
    pub(crate) fn load(&self) -> u64 {
        u64::from_be(self.cell.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn entry(&self) -> RadixEntry {
        RadixEntry::decode(self.load())
    }

    /// Publish a new value. Release orders preceding writes to a freshly
    /// built child table before the hardware can follow the pointer.
    #[inline]
    pub(crate) fn store(&self, raw: u64) {
        self.cell.store(raw.to_be(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn swap(&self, raw: u64) -> u64 {
        u64::from_be(self.cell.swap(raw.to_be(), Ordering::AcqRel))
    }

    /// Load-and-clear; the returned value is the last one the hardware
    /// could have updated.
    #[inline]
    pub(crate) fn clear(&self) -> u64 {
        self.swap(0)
    }

    #[inline]
    pub(crate) fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.cell
            .compare_exchange(current.to_be(), new.to_be(), Ordering::AcqRel, Ordering::Acquire)
            .map(u64::from_be)
            .map_err(u64::from_be)
    }

    /// Atomically OR `bits` in, as the hardware does for `R`/`C`.
    #[inline]
    pub(crate) fn fetch_or(&self, bits: u64) -> u64 {
        // byte swapping commutes with bitwise OR
        u64::from_be(self.cell.fetch_or(bits.to_be(), Ordering::AcqRel))
    }
}
