use super::Mmu;
use crate::addresses::{PageSize, VirtualAddress};
use crate::error::MmuError;
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::{Pmap, PmapState};
use crate::pte::{RadixEntry, RadixPde, RadixPte};
use crate::pv::{PvKey, PvTable};
use crate::table::PteSlot;
use crate::tlb::{InvalidationBatch, TlbInvalidate};
use crate::walk::Walk;

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Split the superpage containing `va` into a table of next-smaller
    /// leaves. Returns `false` if `va` is not mapped by a superpage.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if the table page or the PV entries cannot
    /// be allocated; the superpage is then left untouched.
    /// [`MmuError::OutOfRange`] for an address `pmap` does not translate.
    pub fn demote(&self, pmap: &Pmap, va: VirtualAddress) -> Result<bool, MmuError> {
        self.check_span(pmap, va, 1)?;
        let mut guard = pmap.state.lock();
        let state = &mut *guard;
        let Walk::Superpage { level, slot } = self.walker(pmap).walk(va, crate::Level::L3) else {
            return Ok(false);
        };
        let Some(size) = level.leaf_size() else {
            panic!("leaf entry in a root table");
        };

        let mut batch = self.batch(pmap);
        let result = self.demote_locked(pmap, state, &mut batch, slot, va.align_down(size), size);
        self.settle(batch);
        result.map(|()| true)
    }

    /// Replace the superpage leaf in `slot` by a table of equivalent
    /// leaves. All allocations happen before the tree changes, so a failure
    /// leaves everything as it was.
    pub(super) fn demote_locked(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        slot: PteSlot<'_>,
        va: VirtualAddress,
        size: PageSize,
    ) -> Result<(), MmuError> {
        let RadixEntry::Leaf(pte) = slot.entry() else {
            panic!("demoting a non-leaf entry at {va}");
        };
        let Some(child_size) = size.smaller() else {
            panic!("base page at {va} cannot be demoted");
        };

        let table_pa = self.table_page(state).inspect_err(|_| {
            log::debug!("demotion of {size} {va} in pid {}: no table page", pmap.pid());
        })?;
        if pte.managed()
            && let Err(e) = self.pv.reserve(
                &self.view,
                &self.alloc,
                &mut state.pv_chunks,
                pmap.pid(),
                crate::RPTE_ENTRIES - 1,
            )
        {
            // never visible to the hardware
            self.alloc.free_page(table_pa);
            state.table_pages -= 1;
            log::debug!("demotion of {size} {va} in pid {}: no pv entries", pmap.pid());
            return Err(e);
        }

        let frame = pte.frame();
        let step = child_size.bytes();
        let table = self.walker(pmap).table(child_size.level(), table_pa);
        let child = pte.with_promoted(false);
        for i in 0..crate::RPTE_ENTRIES {
            let offset = i as u64 * step;
            table.slot(i).store(child.with_frame(frame + offset).into_bits());
        }

        let RadixEntry::Leaf(last) = RadixEntry::decode(slot.swap(RadixPde::new_table(table_pa).into_bits()))
        else {
            panic!("superpage at {va} vanished under the address-space lock");
        };
        // refmod bits the hardware set after we copied the leaf
        let late = RadixPte::new()
            .with_referenced(last.referenced())
            .with_changed(last.changed())
            .into_bits();
        if late != 0 {
            for i in 0..crate::RPTE_ENTRIES {
                table.slot(i).fetch_or(late);
            }
        }
        batch.page(va, size);

        if pte.managed() {
            // children first, so every frame stays reachable from some head
            for i in 1..crate::RPTE_ENTRIES {
                let offset = i as u64 * step;
                let r = self.pv.allocate_reserved(&self.view, &mut state.pv_chunks);
                let _bucket = self.pv.lock(frame + offset).write();
                PvTable::link(
                    &self.view,
                    self.pv.head(frame + offset),
                    r,
                    PvKey::new(va + offset, child_size),
                );
            }
            let _bucket = self.pv.lock(frame).write();
            let head = self.pv.head(frame);
            let Some(r) = PvTable::find(&self.view, head, pmap.pid(), PvKey::new(va, size)) else {
                panic!("no pv entry for managed {size} mapping {va} in pid {}", pmap.pid());
            };
            PvTable::unlink(&self.view, head, r);
            PvTable::link(&self.view, head, r, PvKey::new(va, child_size));
        }

        log::debug!(
            "demoted {size} {va} -> {frame} in pid {} into {child_size} leaves",
            pmap.pid()
        );
        Ok(())
    }

    /// Demote, or remove the superpage if demotion fails. Returns whether
    /// the superpage was demoted.
    pub(super) fn demote_or_destroy(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        slot: PteSlot<'_>,
        va: VirtualAddress,
        size: PageSize,
    ) -> bool {
        match self.demote_locked(pmap, state, batch, slot, va, size) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "destroying {size} mapping {va} in pid {} after failed demotion: {e}",
                    pmap.pid()
                );
                self.remove_leaf(pmap, state, batch, slot, va, size);
                false
            }
        }
    }
}
