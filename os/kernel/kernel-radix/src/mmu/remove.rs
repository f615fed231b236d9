use core::sync::atomic::Ordering;

use super::Mmu;
use crate::addresses::{Level, PageSize, VirtualAddress};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::{Pmap, PmapState};
use crate::pte::{RadixEntry, RadixPte};
use crate::pv::{PageAttrs, PvKey, PvTable};
use crate::table::{PteSlot, Table};
use crate::tlb::{InvalidationBatch, TlbInvalidate};

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Remove the mapping of the base page containing `va`, demoting a
    /// superpage if one covers it.
    pub fn remove(&self, pmap: &Pmap, va: VirtualAddress) {
        let start = va.align_down(PageSize::Size4K);
        self.remove_range(pmap, start, start + crate::PAGE_SIZE);
    }

    /// Remove every mapping in `[start, end)`.
    ///
    /// Superpages wholly inside the range go at once; superpages straddling
    /// an edge are demoted first, or destroyed if demotion runs out of
    /// memory. Page-table pages of user address spaces that become empty
    /// are freed after the invalidation.
    ///
    /// # Panics
    /// If the range reaches outside the address space of `pmap`.
    pub fn remove_range(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        let start = start.align_down(PageSize::Size4K);
        let end = VirtualAddress::new(crate::align_up(end.as_u64(), crate::PAGE_SIZE));
        if start >= end {
            return;
        }
        self.assert_span(pmap, start, end);
        // unsynchronized; a racing enter is ordered after this remove
        if pmap.resident.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut guard = pmap.state.lock();
        let state = &mut *guard;
        let mut batch = self.batch(pmap);
        self.visit_leaves(
            pmap,
            state,
            &mut batch,
            start,
            end,
            true,
            &mut |state, batch, slot, va, size| self.remove_leaf(pmap, state, batch, slot, va, size),
        );
        self.settle(batch);
    }

    /// Call `op` for every leaf wholly inside `[start, end)`.
    ///
    /// Leaves straddling an edge are demoted until they fit; one that cannot
    /// be demoted is removed instead. With `reclaim`, user page-table pages
    /// left empty are unlinked and queued on the batch.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn visit_leaves<F>(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        start: VirtualAddress,
        end: VirtualAddress,
        reclaim: bool,
        op: &mut F,
    ) where
        F: FnMut(&mut PmapState, &mut InvalidationBatch, PteSlot<'_>, VirtualAddress, PageSize),
    {
        let root = self.walker(pmap).root();
        self.visit_table(pmap, state, batch, root, Level::L0, start, end, reclaim, op);
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_table<F>(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        table: Table<'_>,
        level: Level,
        start: VirtualAddress,
        end: VirtualAddress,
        reclaim: bool,
        op: &mut F,
    ) where
        F: FnMut(&mut PmapState, &mut InvalidationBatch, PteSlot<'_>, VirtualAddress, PageSize),
    {
        let walker = self.walker(pmap);
        let span = level.entry_span();
        let mut va = start.as_u64();
        while va < end.as_u64() {
            let base = crate::align_down(va, span);
            let next = base.saturating_add(span);
            let hi = next.min(end.as_u64());
            let slot = table.slot(walker.index(VirtualAddress::new(va), level));

            match slot.entry() {
                RadixEntry::Invalid => {}
                RadixEntry::Leaf(_) => {
                    let Some(size) = level.leaf_size() else {
                        panic!("leaf entry in a root table");
                    };
                    let base = VirtualAddress::new(base);
                    if va == base.as_u64() && hi == next {
                        op(state, batch, slot, base, size);
                    } else if self.demote_or_destroy(pmap, state, batch, slot, base, size) {
                        // look at the same slot again, now a table
                        continue;
                    }
                }
                RadixEntry::Table(pa) => {
                    let Some(below) = level.next() else {
                        panic!("non-leaf entry at the last level for {va:#x}");
                    };
                    let child = walker.table(below, pa);
                    self.visit_table(
                        pmap,
                        state,
                        batch,
                        child,
                        below,
                        VirtualAddress::new(va),
                        VirtualAddress::new(hi),
                        reclaim,
                        op,
                    );
                    if reclaim && !pmap.is_kernel() && child.is_empty() {
                        slot.clear();
                        batch.defer_free_table(pa);
                        state.table_pages -= 1;
                        log::trace!("pid {} releases {below:?} table {pa}", pmap.pid());
                    }
                }
            }
            va = hi;
        }
    }

    /// Clear the leaf in `slot` and undo its accounting.
    pub(super) fn remove_leaf(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        slot: PteSlot<'_>,
        va: VirtualAddress,
        size: PageSize,
    ) {
        let RadixEntry::Leaf(pte) = RadixEntry::decode(slot.clear()) else {
            panic!("removing a non-leaf entry at {va}");
        };
        let pages = size.base_pages();
        pmap.resident.fetch_sub(pages, Ordering::AcqRel);
        if pte.wired() {
            pmap.wired.fetch_sub(pages, Ordering::AcqRel);
        }
        batch.page(va, size);
        if pte.managed() {
            self.pv_detach(pmap, state, batch, pte, va, size);
        }
        log::trace!("remove pid {} {size} {va} -> {}", pmap.pid(), pte.frame());
    }

    /// Drop the PV entry of a removed leaf and fold its hardware bits into
    /// the frame state.
    fn pv_detach(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        pte: RadixPte,
        va: VirtualAddress,
        size: PageSize,
    ) {
        let frame = pte.frame();
        let r = {
            let _bucket = self.pv.lock(frame).write();
            let head = self.pv.head(frame);
            let Some(r) = PvTable::find(&self.view, head, pmap.pid(), PvKey::new(va, size)) else {
                panic!(
                    "no pv entry for managed {size} mapping {va} -> {frame} in pid {}",
                    pmap.pid()
                );
            };
            PvTable::unlink(&self.view, head, r);
            r
        };

        let mut attrs = PageAttrs::empty();
        attrs.set(PageAttrs::DIRTY, pte.is_dirty());
        attrs.set(PageAttrs::REFERENCED, pte.referenced());
        if !attrs.is_empty() {
            self.propagate(frame, size, attrs);
        }
        if let Some(chunk) = self.pv.free(&self.view, &mut state.pv_chunks, r) {
            batch.defer_free(chunk, crate::PAGE_SIZE);
        }
    }
}
