//! Operations that start from a physical frame and reach every mapping of
//! it through the reverse map.
//!
//! A frame `f` can be mapped by a base page, by a 2 MiB superpage starting
//! at `f` aligned down to 2 MiB, or by a 1 GiB superpage starting at `f`
//! aligned down to 1 GiB. Each of these keeps its PV entry on the head of
//! its first frame, so a scan looks at up to three heads.

use alloc::vec::Vec;
use core::ops::ControlFlow;

use super::{Mmu, PageMapping, update_leaf};
use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::error::MmuError;
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::Pmap;
use crate::pte::RadixEntry;
use crate::pv::{PageAttrs, PvKey, PvTable};
use crate::table::PteSlot;
use crate::tlb::{InvalidationBatch, TlbInvalidate};

/// Maximum number of mappings [`Mmu::ts_referenced`] reports.
pub const TS_REFERENCED_MAX: u32 = 5;

/// Entries [`Mmu::page_exists_quick`] looks at before giving up.
pub const PAGE_EXISTS_QUICK_MAX: usize = 16;

/// A leaf reached from the reverse map with its address space locked.
struct Visit<'a> {
    slot: PteSlot<'a>,
    /// Start of the leaf.
    va: VirtualAddress,
    size: PageSize,
    batch: &'a mut InvalidationBatch,
}

enum Step {
    Done,
    Restart,
    Stop,
}

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Reset the reverse-map state of a frame about to be handed out.
    ///
    /// # Errors
    /// [`MmuError::NotManaged`] if `frame` has no reverse map.
    pub fn page_init(&self, frame: PhysicalAddress) -> Result<(), MmuError> {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return Err(MmuError::NotManaged(frame));
        }
        let _bucket = self.pv.lock(frame).write();
        self.pv.head(frame).reset();
        Ok(())
    }

    /// Whether a store went through any mapping of `frame`.
    pub fn is_modified(&self, frame: PhysicalAddress) -> bool {
        self.attr_or_any(frame, PageAttrs::DIRTY, |v| {
            matches!(v.slot.entry(), RadixEntry::Leaf(pte) if pte.is_dirty())
        })
    }

    /// Whether any mapping of `frame` has been used.
    pub fn is_referenced(&self, frame: PhysicalAddress) -> bool {
        self.attr_or_any(frame, PageAttrs::REFERENCED, |v| {
            matches!(v.slot.entry(), RadixEntry::Leaf(pte) if pte.referenced())
        })
    }

    /// Count and clear the referenced bits of the mappings of `frame`,
    /// stopping after [`TS_REFERENCED_MAX`].
    ///
    /// The referenced bit of a superpage also stands for the frames it
    /// covers besides `frame`; clearing it records a reference on each of
    /// them so it is not lost.
    pub fn ts_referenced(&self, frame: PhysicalAddress) -> u32 {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return 0;
        }
        let mut count = u32::from(
            !self
                .pv
                .head(frame)
                .take_attrs(PageAttrs::REFERENCED)
                .is_empty(),
        );
        if count >= TS_REFERENCED_MAX {
            return count;
        }
        self.scan(frame, |v| {
            let (old, _) = update_leaf(v.slot, |pte| pte.with_referenced(false));
            if old.referenced() {
                if v.size != PageSize::Size4K {
                    self.propagate_except(old.frame(), v.size, frame, PageAttrs::REFERENCED);
                }
                v.batch.page(v.va, v.size);
                count += 1;
            }
            if count >= TS_REFERENCED_MAX {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        count
    }

    /// Forget that `frame` was written to. Mappings stay writeable.
    pub fn clear_modify(&self, frame: PhysicalAddress) {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return;
        }
        self.pv.head(frame).take_attrs(PageAttrs::DIRTY);
        self.scan(frame, |v| {
            let (old, _) = update_leaf(v.slot, |pte| pte.with_changed(false));
            if old.is_dirty() {
                if v.size != PageSize::Size4K {
                    // the other frames of the superpage stay dirty
                    self.propagate_except(old.frame(), v.size, frame, PageAttrs::DIRTY);
                }
                v.batch.page(v.va, v.size);
            }
            ControlFlow::Continue(())
        });
    }

    /// Revoke write access from every mapping of `frame`.
    pub fn remove_write(&self, frame: PhysicalAddress) {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return;
        }
        self.scan(frame, |v| {
            let (old, _) = update_leaf(v.slot, |pte| pte.with_write(false).with_changed(false));
            if old.write() {
                if old.is_dirty() {
                    self.propagate(old.frame(), v.size, PageAttrs::DIRTY);
                }
                v.batch.page(v.va, v.size);
            }
            ControlFlow::Continue(())
        });
    }

    /// Remove every mapping of `frame`.
    ///
    /// A superpage covering `frame` is demoted until only the base page of
    /// `frame` goes away; if demotion fails the whole superpage does.
    pub fn remove_all(&self, frame: PhysicalAddress) {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return;
        }
        while let Some((head_pa, pid, key)) = self.first_mapping(frame) {
            let Some(pmap) = self.lookup(pid) else {
                // destroyed after we looked; the entry must be gone now
                let _bucket = self.pv.lock(head_pa).read();
                assert!(
                    PvTable::find(&self.view, self.pv.head(head_pa), pid, key).is_none(),
                    "pid {pid} dropped with live mappings"
                );
                continue;
            };

            let mut guard = pmap.state.lock();
            let state = &mut *guard;
            let present = {
                let _bucket = self.pv.lock(head_pa).read();
                PvTable::find(&self.view, self.pv.head(head_pa), pid, key).is_some()
            };
            if !present {
                continue;
            }
            self.locate(&pmap, key, head_pa);

            let va = key.va() + (frame - head_pa);
            let mut batch = self.batch(&pmap);
            self.visit_leaves(
                &pmap,
                state,
                &mut batch,
                va,
                va + crate::PAGE_SIZE,
                true,
                &mut |state, batch, slot, va, size| {
                    self.remove_leaf(&pmap, state, batch, slot, va, size);
                },
            );
            self.settle(batch);
        }
    }

    /// Wired mappings of `frame`.
    pub fn page_wired_mappings(&self, frame: PhysicalAddress) -> usize {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return 0;
        }
        let mut count = 0;
        self.scan(frame, |v| {
            if matches!(v.slot.entry(), RadixEntry::Leaf(pte) if pte.wired()) {
                count += 1;
            }
            ControlFlow::Continue(())
        });
        count
    }

    /// Whether `pmap` is among the first [`PAGE_EXISTS_QUICK_MAX`]
    /// mappings of `frame`.
    pub fn page_exists_quick(&self, pmap: &Pmap, frame: PhysicalAddress) -> bool {
        let frame = frame.align_down(PageSize::Size4K);
        let mut budget = PAGE_EXISTS_QUICK_MAX;
        for (head_pa, size) in self.covering(frame) {
            let _bucket = self.pv.lock(head_pa).read();
            for (r, key) in PvTable::iter(&self.view, self.pv.head(head_pa)) {
                if key.size() != size {
                    continue;
                }
                if PvTable::owner(&self.view, r) == pmap.pid() {
                    return true;
                }
                budget -= 1;
                if budget == 0 {
                    return false;
                }
            }
        }
        false
    }

    /// Number of mappings of `frame`, counted without taking any lock.
    pub fn mapping_count(&self, frame: PhysicalAddress) -> usize {
        let frame = frame.align_down(PageSize::Size4K);
        self.covering(frame)
            .map(|(head_pa, size)| PvTable::count_lockless(&self.view, self.pv.head(head_pa), size))
            .sum()
    }

    /// Every mapping of `frame`.
    pub fn mappings(&self, frame: PhysicalAddress) -> Vec<PageMapping> {
        let frame = frame.align_down(PageSize::Size4K);
        let mut out = Vec::new();
        for (head_pa, size) in self.covering(frame) {
            let _bucket = self.pv.lock(head_pa).read();
            out.extend(
                PvTable::iter(&self.view, self.pv.head(head_pa))
                    .filter(|(_, key)| key.size() == size)
                    .map(|(r, key)| PageMapping {
                        pid: PvTable::owner(&self.view, r),
                        va: key.va(),
                        size,
                    }),
            );
        }
        out
    }

    /// Heads whose entries of the given size map `frame`.
    fn covering(
        &self,
        frame: PhysicalAddress,
    ) -> impl Iterator<Item = (PhysicalAddress, PageSize)> + '_ {
        [PageSize::Size4K, PageSize::Size2M, PageSize::Size1G]
            .into_iter()
            .map(move |size| (frame.align_down(size), size))
            .filter(|&(head_pa, size)| self.pv.manages(head_pa, size.bytes()))
    }

    fn attr_or_any<F>(&self, frame: PhysicalAddress, attr: PageAttrs, test: F) -> bool
    where
        F: Fn(&Visit<'_>) -> bool,
    {
        let frame = frame.align_down(PageSize::Size4K);
        if !self.pv.manages(frame, crate::PAGE_SIZE) {
            return false;
        }
        if self.pv.head(frame).attrs().contains(attr) {
            return true;
        }
        let mut found = false;
        self.scan(frame, |v| {
            found = test(v);
            if found {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        found
    }

    /// Run `op` on every leaf mapping `frame` until it breaks.
    fn scan<F>(&self, frame: PhysicalAddress, mut op: F)
    where
        F: FnMut(&mut Visit<'_>) -> ControlFlow<()>,
    {
        for (head_pa, size) in self.covering(frame) {
            loop {
                match self.scan_head(head_pa, size, &mut op) {
                    Step::Done => break,
                    Step::Restart => {}
                    Step::Stop => return,
                }
            }
        }
    }

    fn scan_head<F>(&self, head_pa: PhysicalAddress, size: PageSize, op: &mut F) -> Step
    where
        F: FnMut(&mut Visit<'_>) -> ControlFlow<()>,
    {
        let lock = self.pv.lock(head_pa);
        let head = self.pv.head(head_pa);
        let mut bucket = lock.write();
        for (r, key) in PvTable::iter(&self.view, head) {
            if key.size() != size {
                continue;
            }
            let pmap = self.pmap_of(PvTable::owner(&self.view, r));
            let guard = match pmap.state.try_lock() {
                Some(guard) => guard,
                None => {
                    let generation = head.generation();
                    drop(bucket);
                    let guard = pmap.state.lock();
                    bucket = lock.write();
                    if head.generation() != generation {
                        return Step::Restart;
                    }
                    guard
                }
            };

            let slot = self.locate(&pmap, key, head_pa);
            let mut batch = self.batch(&pmap);
            let flow = op(&mut Visit {
                slot,
                va: key.va(),
                size,
                batch: &mut batch,
            });
            self.settle(batch);
            drop(guard);
            if flow.is_break() {
                return Step::Stop;
            }
        }
        drop(bucket);
        Step::Done
    }

    /// First mapping of `frame`, found under a shared bucket lock.
    fn first_mapping(&self, frame: PhysicalAddress) -> Option<(PhysicalAddress, crate::Pid, PvKey)> {
        self.covering(frame).find_map(|(head_pa, size)| {
            let _bucket = self.pv.lock(head_pa).read();
            PvTable::iter(&self.view, self.pv.head(head_pa))
                .find(|(_, key)| key.size() == size)
                .map(|(r, key)| (head_pa, PvTable::owner(&self.view, r), key))
        })
    }

    /// The leaf a PV entry stands for. The address space must be locked.
    fn locate(&self, pmap: &Pmap, key: PvKey, frame: PhysicalAddress) -> PteSlot<'_> {
        let found = self.walker(pmap).find_leaf(key.va());
        match found {
            Some((slot, size))
                if size == key.size()
                    && matches!(slot.entry(), RadixEntry::Leaf(pte) if pte.managed() && pte.frame() == frame) =>
            {
                slot
            }
            _ => panic!(
                "pv entry {} {} of pid {} does not match its leaf",
                key.size(),
                key.va(),
                pmap.pid()
            ),
        }
    }
}
