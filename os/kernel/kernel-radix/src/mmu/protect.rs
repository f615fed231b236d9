use core::sync::atomic::Ordering;

use super::{Mmu, update_leaf};
use crate::addresses::{PageSize, VirtualAddress};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::Pmap;
use crate::pte::Protection;
use crate::pv::PageAttrs;
use crate::tlb::TlbInvalidate;

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Reduce the permissions of every mapping in `[start, end)` to at most
    /// `prot`. Permissions are never added.
    ///
    /// Removing read access removes the mappings. A request that keeps both
    /// write and execute access cannot take anything away and returns at
    /// once.
    ///
    /// # Panics
    /// If the range reaches outside the address space of `pmap`.
    pub fn protect(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress, prot: Protection) {
        if !prot.contains(Protection::READ) && !prot.contains(Protection::WRITE) {
            self.remove_range(pmap, start, end);
            return;
        }
        if prot.contains(Protection::WRITE | Protection::EXECUTE) {
            return;
        }
        let start = start.align_down(PageSize::Size4K);
        let end = VirtualAddress::new(crate::align_up(end.as_u64(), crate::PAGE_SIZE));
        if start >= end {
            return;
        }
        self.assert_span(pmap, start, end);

        let mut guard = pmap.state.lock();
        let state = &mut *guard;
        let mut batch = self.batch(pmap);
        self.visit_leaves(
            pmap,
            state,
            &mut batch,
            start,
            end,
            false,
            &mut |_, batch, slot, va, size| {
                let (old, new) = update_leaf(slot, |pte| {
                    let mut pte = pte;
                    if !prot.contains(Protection::WRITE) {
                        pte = pte.with_write(false).with_changed(false);
                    }
                    if !prot.contains(Protection::EXECUTE) {
                        pte = pte.with_execute(false);
                    }
                    pte
                });
                if old == new {
                    return;
                }
                if old.managed() && old.is_dirty() && !new.write() {
                    self.propagate(old.frame(), size, PageAttrs::DIRTY);
                }
                batch.page(va, size);
            },
        );
        self.settle(batch);
    }

    /// Clear the wired attribute of every mapping in `[start, end)`.
    ///
    /// Superpages that only partly overlap the range are demoted first.
    ///
    /// # Panics
    /// If the range reaches outside the address space of `pmap`.
    pub fn unwire(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        let start = start.align_down(PageSize::Size4K);
        let end = VirtualAddress::new(crate::align_up(end.as_u64(), crate::PAGE_SIZE));
        if start >= end {
            return;
        }
        self.assert_span(pmap, start, end);

        let mut guard = pmap.state.lock();
        let state = &mut *guard;
        let mut batch = self.batch(pmap);
        self.visit_leaves(
            pmap,
            state,
            &mut batch,
            start,
            end,
            false,
            &mut |_, _, slot, va, size| {
                let (old, _) = update_leaf(slot, |pte| pte.with_wired(false));
                if old.wired() {
                    pmap.wired.fetch_sub(size.base_pages(), Ordering::AcqRel);
                    log::trace!("unwired pid {} {size} {va}", pmap.pid());
                }
            },
        );
        // only a failed demotion can have queued anything
        self.settle(batch);
    }
}
