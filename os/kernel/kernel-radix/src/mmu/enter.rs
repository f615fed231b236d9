use core::sync::atomic::Ordering;

use super::{EnterFlags, Mmu, update_leaf};
use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::error::MmuError;
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::{Pmap, PmapState};
use crate::pte::{Protection, RadixEntry, RadixPte};
use crate::pv::{PageAttrs, PvKey, PvRef, PvTable};
use crate::table::PteSlot;
use crate::tlb::{InvalidationBatch, TlbInvalidate};
use crate::walk::Walk;

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Map `va` to `frame` with a leaf of `size`.
    ///
    /// An existing leaf for another frame is removed first; one for the same
    /// frame is updated in place, keeping its referenced and changed bits.
    /// A larger superpage in the way is demoted; smaller mappings in the
    /// way of a superpage are removed.
    ///
    /// # Errors
    /// - [`MmuError::Misaligned`] if `va` or `frame` is not aligned to `size`.
    /// - [`MmuError::OutOfRange`] if the mapping does not fit the part of
    ///   the address space `pmap` translates.
    /// - [`MmuError::NotManaged`] for a managed mapping of a frame without a
    ///   reverse map.
    /// - [`MmuError::OutOfMemory`] when a page-table page or PV chunk cannot
    ///   be allocated. The address space is left without the new mapping.
    pub fn enter(
        &self,
        pmap: &Pmap,
        va: VirtualAddress,
        frame: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
        size: PageSize,
    ) -> Result<(), MmuError> {
        Self::check_aligned(va.as_u64(), size)?;
        Self::check_aligned(frame.as_u64(), size)?;
        self.check_span(pmap, va, size.bytes())?;
        let managed = flags.contains(EnterFlags::MANAGED);
        if managed && !self.pv.manages(frame, size.bytes()) {
            return Err(MmuError::NotManaged(frame));
        }

        let pte = Self::leaf_for(pmap, frame, prot, flags);
        let mut guard = pmap.state.lock();
        let state = &mut *guard;
        let mut batch = self.batch(pmap);

        let result = self.enter_locked(pmap, state, &mut batch, va, pte, size);
        self.settle(batch);
        drop(guard);
        result
    }

    /// The leaf [`enter`](Self::enter) installs.
    pub(super) fn leaf_for(
        pmap: &Pmap,
        frame: PhysicalAddress,
        prot: Protection,
        flags: EnterFlags,
    ) -> RadixPte {
        let pte = RadixPte::new_leaf(frame, prot)
            .with_privileged(pmap.is_kernel())
            .with_referenced(true)
            .with_wired(flags.contains(EnterFlags::WIRED))
            .with_managed(flags.contains(EnterFlags::MANAGED));
        if flags.contains(EnterFlags::WRITE_FAULT) && pte.write() {
            pte.with_changed(true)
        } else {
            pte
        }
    }

    pub(super) fn enter_locked(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        va: VirtualAddress,
        pte: RadixPte,
        size: PageSize,
    ) -> Result<(), MmuError> {
        // the PV entry comes first so that a failure changes nothing
        let pv = if pte.managed() {
            Some(
                self.pv
                    .allocate(&self.view, &self.alloc, &mut state.pv_chunks, pmap.pid())?,
            )
        } else {
            None
        };

        let consumed = self.install_leaf(pmap, state, batch, va, pte, size, pv);
        if let Some(r) = pv
            && !matches!(consumed, Ok(true))
            && let Some(chunk) = self.pv.free(&self.view, &mut state.pv_chunks, r)
        {
            batch.defer_free(chunk, crate::PAGE_SIZE);
        }
        consumed.map(|_| ())
    }

    /// Returns whether `pv` was linked.
    #[allow(clippy::too_many_arguments)]
    fn install_leaf(
        &self,
        pmap: &Pmap,
        state: &mut PmapState,
        batch: &mut InvalidationBatch,
        va: VirtualAddress,
        pte: RadixPte,
        size: PageSize,
        pv: Option<PvRef>,
    ) -> Result<bool, MmuError> {
        let walker = self.walker(pmap);
        let slot = loop {
            let slot = match walker.walk_create(va, size.level(), || self.table_page(state))? {
                Walk::Slot(slot) => slot,
                Walk::Superpage { level, slot } => {
                    let Some(covering) = level.leaf_size() else {
                        panic!("leaf entry in a root table");
                    };
                    self.demote_locked(pmap, state, batch, slot, va.align_down(covering), covering)?;
                    continue;
                }
                Walk::Absent(level) => panic!("walk_create left {level:?} absent"),
            };

            match slot.entry() {
                RadixEntry::Invalid => break slot,
                RadixEntry::Table(_) => {
                    assert!(
                        !pmap.is_kernel(),
                        "{size} mapping requested over a kernel page-table page at {va}"
                    );
                    // removing everything below unlinks the emptied table
                    self.visit_leaves(
                        pmap,
                        state,
                        batch,
                        va,
                        va + size.bytes(),
                        true,
                        &mut |state, batch, slot, va, size| {
                            self.remove_leaf(pmap, state, batch, slot, va, size);
                        },
                    );
                }
                RadixEntry::Leaf(old)
                    if old.frame() == pte.frame() && old.managed() == pte.managed() =>
                {
                    self.update_in_place(pmap, batch, slot, pte, va, size);
                    return Ok(false);
                }
                RadixEntry::Leaf(_) => {
                    self.remove_leaf(pmap, state, batch, slot, va, size);
                    break slot;
                }
            }
        };

        if let Some(r) = pv {
            let frame = pte.frame();
            let _bucket = self.pv.lock(frame).write();
            PvTable::link(&self.view, self.pv.head(frame), r, PvKey::new(va, size));
        }
        // PV state is in place before the hardware can see the entry
        slot.store(pte.into_bits());
        pmap.resident.fetch_add(size.base_pages(), Ordering::AcqRel);
        if pte.wired() {
            pmap.wired.fetch_add(size.base_pages(), Ordering::AcqRel);
        }
        log::trace!(
            "enter pid {} {size} {va} -> {} {:?}",
            pmap.pid(),
            pte.frame(),
            pte.protection()
        );
        Ok(pv.is_some())
    }

    /// Same frame, new attributes.
    fn update_in_place(
        &self,
        pmap: &Pmap,
        batch: &mut InvalidationBatch,
        slot: PteSlot<'_>,
        pte: RadixPte,
        va: VirtualAddress,
        size: PageSize,
    ) {
        let (old, new) = update_leaf(slot, |cur| {
            let next = pte
                .with_referenced(cur.referenced() || pte.referenced())
                .with_changed(cur.changed() || pte.changed());
            if next.write() { next } else { next.with_changed(false) }
        });

        let pages = size.base_pages();
        match (old.wired(), new.wired()) {
            (false, true) => {
                pmap.wired.fetch_add(pages, Ordering::AcqRel);
            }
            (true, false) => {
                pmap.wired.fetch_sub(pages, Ordering::AcqRel);
            }
            _ => {}
        }
        if old.managed() && old.is_dirty() && !new.write() {
            self.propagate(old.frame(), size, PageAttrs::DIRTY);
        }
        if !new.protection().contains(old.protection()) {
            batch.page(va, size);
        }
        log::trace!(
            "update pid {} {size} {va}: {:?} -> {:?}",
            pmap.pid(),
            old.protection(),
            new.protection()
        );
    }
}
