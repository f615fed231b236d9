//! # Radix Tree Walker
//!
//! Finds the entry for a virtual address at a given level, optionally
//! creating missing intermediate tables on the way down.
//!
//! The walker never writes a leaf and never demotes. When it meets a leaf
//! above the requested level it reports a [`Walk::Superpage`] and the caller
//! decides what to do with it.
//!
//! [`Walker::translate`] repeats what the hardware walker does on a TLB
//! miss, including the `R`/`C` updates; it lets software observe the
//! effect of a mapping without real hardware.

use crate::addresses::{Level, PageSize, PhysicalAddress, VirtualAddress};
use crate::error::MmuError;
use crate::phys::PhysicalMemoryView;
use crate::pte::{RadixEntry, RadixPde};
use crate::table::{PteSlot, Table};

/// The root table of one address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RootTable {
    pa: PhysicalAddress,
    index_bits: u32,
}

/// Outcome of a walk.
pub(crate) enum Walk<'a> {
    /// The entry at the requested level. It may hold anything.
    Slot(PteSlot<'a>),
    /// An intermediate entry at this level is invalid.
    Absent(Level),
    /// A leaf at `level` covers the address above the requested level.
    Superpage { level: Level, slot: PteSlot<'a> },
}

/// Kind of access for [`Walker::translate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Why a translation failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("no translation for {0}")]
    NotMapped(VirtualAddress),
    #[error("{access:?} access to {va} denied")]
    Protection { va: VirtualAddress, access: Access },
}

impl RootTable {
    #[must_use]
    pub const fn new(pa: PhysicalAddress, index_bits: u32) -> Self {
        Self { pa, index_bits }
    }

    #[inline]
    #[must_use]
    pub const fn pa(self) -> PhysicalAddress {
        self.pa
    }

    /// log2 of the number of root entries.
    #[inline]
    #[must_use]
    pub const fn index_bits(self) -> u32 {
        self.index_bits
    }

    #[inline]
    #[must_use]
    pub const fn entries(self) -> usize {
        1 << self.index_bits
    }

    /// Size of the root table in bytes; also its required alignment.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        8 << self.index_bits
    }
}

pub(crate) struct Walker<'a, V> {
    view: &'a V,
    root: RootTable,
}

impl<'a, V: PhysicalMemoryView> Walker<'a, V> {
    pub(crate) const fn new(view: &'a V, root: RootTable) -> Self {
        Self { view, root }
    }

    pub(crate) fn root(&self) -> Table<'a> {
        Table::at(self.view, self.root.pa, self.root.entries())
    }

    /// The table at `level` stored at `pa`.
    pub(crate) fn table(&self, level: Level, pa: PhysicalAddress) -> Table<'a> {
        let len = if level == Level::L0 {
            self.root.entries()
        } else {
            crate::RPTE_ENTRIES
        };
        Table::at(self.view, pa, len)
    }

    /// Index of `va` at `level`.
    #[inline]
    pub(crate) const fn index(&self, va: VirtualAddress, level: Level) -> usize {
        va.index(level, self.root.index_bits)
    }

    /// Walk towards `target` without changing the tree.
    pub(crate) fn walk(&self, va: VirtualAddress, target: Level) -> Walk<'a> {
        let mut level = Level::L0;
        let mut table = self.root();
        loop {
            let slot = table.slot(self.index(va, level));
            if level == target {
                return Walk::Slot(slot);
            }
            let next = Self::below(level);
            match slot.entry() {
                RadixEntry::Table(pa) => table = self.table(next, pa),
                RadixEntry::Leaf(_) => return Self::superpage(level, slot),
                RadixEntry::Invalid => return Walk::Absent(level),
            }
            level = next;
        }
    }

    /// Walk towards `target`, allocating every missing intermediate table
    /// with `allocate`. The callback returns a zeroed page and is
    /// responsible for charging it to the owning address space.
    ///
    /// Never returns [`Walk::Absent`].
    pub(crate) fn walk_create<F>(
        &self,
        va: VirtualAddress,
        target: Level,
        mut allocate: F,
    ) -> Result<Walk<'a>, MmuError>
    where
        F: FnMut() -> Result<PhysicalAddress, MmuError>,
    {
        let mut level = Level::L0;
        let mut table = self.root();
        loop {
            let slot = table.slot(self.index(va, level));
            if level == target {
                return Ok(Walk::Slot(slot));
            }
            let next = Self::below(level);
            match slot.entry() {
                RadixEntry::Table(pa) => table = self.table(next, pa),
                RadixEntry::Leaf(_) => return Ok(Self::superpage(level, slot)),
                RadixEntry::Invalid => {
                    let pa = allocate()?;
                    // invalid -> valid needs no invalidation
                    slot.store(RadixPde::new_table(pa).into_bits());
                    log::trace!("new {next:?} table {pa} for {va}");
                    table = self.table(next, pa);
                }
            }
            level = next;
        }
    }

    /// Locate the leaf mapping `va`, whatever its size.
    pub(crate) fn find_leaf(&self, va: VirtualAddress) -> Option<(PteSlot<'a>, PageSize)> {
        let (slot, level) = match self.walk(va, Level::L3) {
            Walk::Slot(slot) => (slot, Level::L3),
            Walk::Superpage { level, slot } => (slot, level),
            Walk::Absent(_) => return None,
        };
        match slot.entry() {
            RadixEntry::Leaf(_) => level.leaf_size().map(|size| (slot, size)),
            _ => None,
        }
    }

    /// Translate `va` like the hardware walker: check the access against
    /// the leaf, then set `R` (and `C` for stores) before completing.
    pub(crate) fn translate(
        &self,
        va: VirtualAddress,
        access: Access,
        privileged: bool,
    ) -> Result<PhysicalAddress, Fault> {
        let (slot, size) = self.find_leaf(va).ok_or(Fault::NotMapped(va))?;
        loop {
            let raw = slot.load();
            let RadixEntry::Leaf(pte) = RadixEntry::decode(raw) else {
                return Err(Fault::NotMapped(va));
            };
            let allowed = match access {
                Access::Read => pte.read(),
                Access::Write => pte.write(),
                Access::Execute => pte.execute(),
            };
            if !allowed || (pte.privileged() && !privileged) {
                return Err(Fault::Protection { va, access });
            }

            let updated = pte
                .with_referenced(true)
                .with_changed(pte.changed() || access == Access::Write);
            if updated == pte || slot.compare_exchange(raw, updated.into_bits()).is_ok() {
                return Ok(pte.frame() + va.page_offset(size));
            }
        }
    }

    fn below(level: Level) -> Level {
        let Some(next) = level.next() else {
            panic!("walk continued below the last level");
        };
        next
    }

    fn superpage(level: Level, slot: PteSlot<'a>) -> Walk<'a> {
        assert!(level != Level::L0, "leaf entry in a root table");
        Walk::Superpage { level, slot }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::{Protection, RadixPte};
    use crate::phys::FrameAllocator;
    use crate::test_stubs::{TestFrames, TestMemory};

    fn setup(frames: &TestFrames) -> RootTable {
        let root = frames.allocate_zeroed(8 << 13, 8 << 13).expect("root");
        RootTable::new(root, 13)
    }

    #[test]
    fn walk_reports_the_first_absent_level() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let root = setup(&frames);
        let walker = Walker::new(&mem, root);

        assert!(matches!(
            walker.walk(VirtualAddress::new(0x1000), Level::L3),
            Walk::Absent(Level::L0)
        ));
    }

    #[test]
    fn walk_create_builds_the_chain_once() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let root = setup(&frames);
        let walker = Walker::new(&mem, root);
        let mut created = 0;

        let va = VirtualAddress::new(0x7f_1234_5000);
        let walk = walker
            .walk_create(va, Level::L3, || {
                created += 1;
                frames.allocate_page().ok_or(MmuError::OutOfMemory(crate::Resource::PageTable))
            })
            .expect("walk");
        let Walk::Slot(slot) = walk else {
            panic!("slot expected");
        };
        assert_eq!(created, 3);
        slot.store(RadixPte::new_leaf(PhysicalAddress::new(0x5000), Protection::READ).into_bits());

        // the second walk finds everything in place
        let walk = walker
            .walk_create(va, Level::L3, || panic!("no allocation expected"))
            .expect("walk");
        assert!(matches!(walk, Walk::Slot(_)));
        assert_eq!(
            walker.translate(va + 0x10, Access::Read, false),
            Ok(PhysicalAddress::new(0x5010))
        );
    }

    #[test]
    fn superpage_leaf_stops_the_walk() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let root = setup(&frames);
        let walker = Walker::new(&mem, root);

        let va = VirtualAddress::new(0x4000_0000);
        let Ok(Walk::Slot(l2)) = walker.walk_create(va, Level::L2, || {
            frames.allocate_page().ok_or(MmuError::OutOfMemory(crate::Resource::PageTable))
        }) else {
            panic!("slot expected");
        };
        l2.store(
            RadixPte::new_leaf(PhysicalAddress::new(0x20_0000), Protection::READ_WRITE).into_bits(),
        );

        assert!(matches!(
            walker.walk(va + 0x3000, Level::L3),
            Walk::Superpage { level: Level::L2, .. }
        ));
        let (_, size) = walker.find_leaf(va + 0x3000).expect("leaf");
        assert_eq!(size, PageSize::Size2M);
        assert_eq!(
            walker.translate(va + 0x3000, Access::Write, false),
            Ok(PhysicalAddress::new(0x20_3000))
        );
    }

    #[test]
    fn translate_enforces_permissions_and_sets_refmod() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let root = setup(&frames);
        let walker = Walker::new(&mem, root);
        let va = VirtualAddress::new(0x1000);

        let Ok(Walk::Slot(slot)) = walker.walk_create(va, Level::L3, || {
            frames.allocate_page().ok_or(MmuError::OutOfMemory(crate::Resource::PageTable))
        }) else {
            panic!("slot expected");
        };
        let pte = RadixPte::new_leaf(PhysicalAddress::new(0x9000), Protection::READ);
        slot.store(pte.with_privileged(true).into_bits());

        assert_eq!(
            walker.translate(va, Access::Read, false),
            Err(Fault::Protection { va, access: Access::Read })
        );
        slot.store(pte.into_bits());
        assert_eq!(
            walker.translate(va, Access::Write, false),
            Err(Fault::Protection { va, access: Access::Write })
        );
        assert!(walker.translate(va, Access::Read, false).is_ok());

        let RadixEntry::Leaf(now) = slot.entry() else {
            panic!("leaf expected");
        };
        assert!(now.referenced());
        assert!(!now.changed());
    }
}
