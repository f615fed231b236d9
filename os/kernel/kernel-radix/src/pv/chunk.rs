//! Page-sized containers of PV entries.
//!
//! ```text
//!  0      8                32       64                             4096
//!  ┌──────┬────────────────┬────────┬──────────┬─────┬──────────────┐
//!  │owner │ free map [3]   │ unused │ entry 0  │ ... │ entry 167    │
//!  └──────┴────────────────┴────────┴──────────┴─────┴──────────────┘
//! ```
//!
//! A chunk belongs to one address space (`owner`). A set bit in the free
//! map marks a free slot. Each entry is three words: the key and the two
//! links of the reverse-map list it sits on.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::registry::Pid;

pub(crate) const PV_CHUNK_ENTRIES: usize = 168;

const HEADER_BYTES: u64 = 64;
const ENTRY_BYTES: u64 = 24;

/// Free map of an empty chunk.
const FREE_MASKS: [u64; 3] = [u64::MAX, u64::MAX, 0xff_ffff_ffff];

#[repr(C)]
pub(crate) struct PvChunk {
    owner: AtomicU64,
    map: [AtomicU64; 3],
    _unused: [AtomicU64; 4],
    entries: [PvEntry; PV_CHUNK_ENTRIES],
}

#[repr(C)]
pub(crate) struct PvEntry {
    key: AtomicU64,
    pub(super) next: AtomicU64,
    pub(super) prev: AtomicU64,
}

const _: () = {
    assert!(size_of::<PvChunk>() == crate::PAGE_SIZE as usize);
    assert!(size_of::<PvEntry>() == ENTRY_BYTES as usize);
    assert!(
        FREE_MASKS[0].count_ones() + FREE_MASKS[1].count_ones() + FREE_MASKS[2].count_ones()
            == PV_CHUNK_ENTRIES as u32
    );
};

/// What a PV entry maps: the virtual address of the leaf and its size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PvKey(u64);

impl PvKey {
    pub(crate) const fn new(va: VirtualAddress, size: PageSize) -> Self {
        let code = match size {
            PageSize::Size4K => 0,
            PageSize::Size2M => 1,
            PageSize::Size1G => 2,
        };
        Self(va.as_u64() | code)
    }

    pub(crate) const fn va(self) -> VirtualAddress {
        VirtualAddress::new(self.0 & !(crate::PAGE_SIZE - 1))
    }

    pub(crate) const fn size(self) -> PageSize {
        match self.0 & 0x3 {
            0 => PageSize::Size4K,
            1 => PageSize::Size2M,
            _ => PageSize::Size1G,
        }
    }
}

/// Location of a PV entry: its physical address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PvRef(u64);

impl PvRef {
    pub(crate) const NIL: Self = Self(u64::MAX);

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn is_nil(self) -> bool {
        self.0 == u64::MAX
    }

    pub(crate) const fn pa(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    /// The chunk holding this entry.
    pub(crate) const fn chunk(self) -> PhysicalAddress {
        PhysicalAddress::new(crate::align_down(self.0, crate::PAGE_SIZE))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn slot(self) -> usize {
        ((self.0 - self.chunk().as_u64() - HEADER_BYTES) / ENTRY_BYTES) as usize
    }

    /// Whether the offset inside the page could name an entry. Used by
    /// lock-free readers that may follow a stale link.
    pub(crate) const fn is_well_formed(self) -> bool {
        let offset = self.0 & (crate::PAGE_SIZE - 1);
        offset >= HEADER_BYTES && (offset - HEADER_BYTES) % ENTRY_BYTES == 0
    }

    pub(crate) const fn at(chunk: PhysicalAddress, slot: usize) -> Self {
        Self(chunk.as_u64() + HEADER_BYTES + slot as u64 * ENTRY_BYTES)
    }
}

impl PvEntry {
    pub(crate) fn key(&self) -> PvKey {
        PvKey(self.key.load(Ordering::Relaxed))
    }

    pub(crate) fn set_key(&self, key: PvKey) {
        self.key.store(key.0, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> PvRef {
        PvRef(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn prev(&self) -> PvRef {
        PvRef(self.prev.load(Ordering::Acquire))
    }
}

impl PvChunk {
    /// Claim a freshly zeroed page for `owner`.
    pub(crate) fn init(&self, owner: Pid) {
        self.owner.store(u64::from(owner.as_u32()), Ordering::Relaxed);
        for (word, mask) in self.map.iter().zip(FREE_MASKS) {
            word.store(mask, Ordering::Relaxed);
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn owner(&self) -> Pid {
        Pid::new(self.owner.load(Ordering::Relaxed) as u32)
    }

    pub(crate) fn entry(&self, slot: usize) -> &PvEntry {
        &self.entries[slot]
    }

    /// Take the lowest free slot.
    pub(crate) fn take(&self) -> Option<usize> {
        for (i, word) in self.map.iter().enumerate() {
            let bits = word.load(Ordering::Relaxed);
            if bits != 0 {
                let bit = bits.trailing_zeros();
                word.store(bits & !(1 << bit), Ordering::Relaxed);
                return Some(i * 64 + bit as usize);
            }
        }
        None
    }

    pub(crate) fn put(&self, slot: usize) {
        let word = &self.map[slot / 64];
        let bit = 1 << (slot % 64);
        let bits = word.load(Ordering::Relaxed);
        assert!(bits & bit == 0, "pv entry {slot} freed twice");
        word.store(bits | bit, Ordering::Relaxed);
    }

    pub(crate) fn free_slots(&self) -> u32 {
        self.map
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.map.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map
            .iter()
            .zip(FREE_MASKS)
            .all(|(w, mask)| w.load(Ordering::Relaxed) == mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys::PhysicalMemoryView;
    use crate::test_stubs::TestMemory;

    #[test]
    fn slots_fill_and_drain() {
        let mem = TestMemory::new(1 << 20);
        let pa = PhysicalAddress::new(0x3000);
        let chunk: &PvChunk = unsafe { mem.phys_to_ref(pa) };
        chunk.init(Pid::new(4));

        assert!(chunk.is_empty());
        assert_eq!(chunk.owner(), Pid::new(4));
        let taken: Vec<_> = core::iter::from_fn(|| chunk.take()).collect();
        assert_eq!(taken.len(), PV_CHUNK_ENTRIES);
        assert!(chunk.is_full());

        chunk.put(100);
        assert_eq!(chunk.free_slots(), 1);
        assert_eq!(chunk.take(), Some(100));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_put_panics() {
        let mem = TestMemory::new(1 << 20);
        let chunk: &PvChunk = unsafe { mem.phys_to_ref(PhysicalAddress::new(0x3000)) };
        chunk.init(Pid::new(1));
        chunk.put(3);
    }

    #[test]
    fn refs_locate_their_chunk_and_slot() {
        let r = PvRef::at(PhysicalAddress::new(0x7000), 167);
        assert_eq!(r.chunk(), PhysicalAddress::new(0x7000));
        assert_eq!(r.slot(), 167);
        assert!(r.is_well_formed());
        assert!(!PvRef::from_raw(0x7000 + 65).is_well_formed());
        assert!(!PvRef::from_raw(0x7008).is_well_formed());
    }

    #[test]
    fn keys_carry_the_mapping_size() {
        let key = PvKey::new(VirtualAddress::new(0x4000_0000), PageSize::Size1G);
        assert_eq!(key.va(), VirtualAddress::new(0x4000_0000));
        assert_eq!(key.size(), PageSize::Size1G);
        assert_ne!(key, PvKey::new(VirtualAddress::new(0x4000_0000), PageSize::Size2M));
    }
}
