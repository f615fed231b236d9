use core::sync::atomic::Ordering;

use kernel_info::memory::{
    DMAP_BASE_ADDRESS, DMAP_MAX_ADDRESS, L2_PAGE_SIZE, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS,
};

use super::{EnterFlags, Mmu};
use crate::addresses::{Level, PageSize, PhysicalAddress, VirtualAddress};
use crate::error::MmuError;
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::Pmap;
use crate::pte::{Protection, RadixEntry};
use crate::tlb::TlbInvalidate;
use crate::walk::{Access, Fault, Walk};

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Physical address `va` translates to in `pmap`, if mapped.
    pub fn extract(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        if self.check_span(pmap, va, 1).is_err() {
            return None;
        }
        let _guard = pmap.state.lock();
        let (slot, size) = self.walker(pmap).find_leaf(va)?;
        match slot.entry() {
            RadixEntry::Leaf(pte) => Some(pte.frame() + va.page_offset(size)),
            _ => None,
        }
    }

    /// Perform an `access` to `va` the way the hardware would, updating the
    /// referenced and changed bits of the leaf. Accesses through the kernel
    /// address space are privileged.
    ///
    /// # Errors
    /// The [`Fault`] the hardware would raise.
    pub fn access(&self, pmap: &Pmap, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, Fault> {
        if self.check_span(pmap, va, 1).is_err() {
            return Err(Fault::NotMapped(va));
        }
        let _guard = pmap.state.lock();
        self.walker(pmap).translate(va, access, pmap.is_kernel())
    }

    /// Physical address of a kernel virtual address. Direct-map addresses
    /// are translated arithmetically.
    pub fn kextract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if (DMAP_BASE_ADDRESS..=DMAP_MAX_ADDRESS).contains(&va.as_u64()) {
            return Some(PhysicalAddress::new(va.as_u64() - DMAP_BASE_ADDRESS));
        }
        self.extract(&self.kernel, va)
    }

    /// Map one kernel page, read-write and unmanaged.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if an intermediate table is missing and
    /// cannot be allocated.
    pub fn kenter(&self, va: VirtualAddress, frame: PhysicalAddress) -> Result<(), MmuError> {
        Self::assert_kva(va, crate::PAGE_SIZE);
        self.enter(
            &self.kernel,
            va,
            frame,
            Protection::READ_WRITE,
            EnterFlags::WRITE_FAULT,
            PageSize::Size4K,
        )
    }

    pub fn kremove(&self, va: VirtualAddress) {
        Self::assert_kva(va, crate::PAGE_SIZE);
        self.remove(&self.kernel, va);
    }

    /// Map `frames` at consecutive kernel pages starting at `va`, replacing
    /// whatever is there, with a single invalidation at the end.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] as for [`kenter`](Self::kenter); pages
    /// entered before the failure stay mapped.
    pub fn qenter(&self, va: VirtualAddress, frames: &[PhysicalAddress]) -> Result<(), MmuError> {
        Self::assert_kva(va, frames.len() as u64 * crate::PAGE_SIZE);
        Self::check_aligned(va.as_u64(), PageSize::Size4K)?;
        let mut guard = self.kernel.state.lock();
        let state = &mut *guard;
        let mut batch = self.batch(&self.kernel);
        let mut result = Ok(());
        for (i, &frame) in frames.iter().enumerate() {
            let pte = Self::leaf_for(&self.kernel, frame, Protection::READ_WRITE, EnterFlags::WRITE_FAULT);
            let page = va + i as u64 * crate::PAGE_SIZE;
            result = Self::check_aligned(frame.as_u64(), PageSize::Size4K)
                .and_then(|()| self.enter_locked(&self.kernel, state, &mut batch, page, pte, PageSize::Size4K));
            if result.is_err() {
                break;
            }
        }
        self.settle(batch);
        result
    }

    /// Undo [`qenter`](Self::qenter) for `count` pages.
    pub fn qremove(&self, va: VirtualAddress, count: usize) {
        let len = count as u64 * crate::PAGE_SIZE;
        Self::assert_kva(va, len);
        self.remove_range(&self.kernel, va, va + len);
    }

    /// Make sure level-3 kernel tables exist for all of KVA below `end`.
    /// Returns the new end of the backed range.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if a table page cannot be allocated; the
    /// range grown until then is kept.
    pub fn grow_kernel(&self, end: VirtualAddress) -> Result<VirtualAddress, MmuError> {
        let end = crate::align_up(end.as_u64(), L2_PAGE_SIZE).min(VM_MAX_KERNEL_ADDRESS + 1);
        let mut guard = self.kernel.state.lock();
        let state = &mut *guard;
        let walker = self.walker(&self.kernel);

        let mut current = self.kernel_end.load(Ordering::Acquire);
        while current < end {
            match walker.walk_create(VirtualAddress::new(current), Level::L3, || self.table_page(state))? {
                Walk::Slot(_) => {}
                Walk::Superpage { level, .. } => {
                    panic!("{level:?} superpage inside KVA at {current:#x}")
                }
                Walk::Absent(level) => panic!("walk_create left {level:?} absent"),
            }
            current += L2_PAGE_SIZE;
            self.kernel_end.store(current, Ordering::Release);
        }
        log::debug!("kernel VA backed up to {current:#x}");
        Ok(VirtualAddress::new(current))
    }

    fn assert_kva(va: VirtualAddress, len: u64) {
        assert!(
            va.as_u64() >= VM_MIN_KERNEL_ADDRESS
                && va.as_u64().checked_add(len).is_some_and(|end| end - 1 <= VM_MAX_KERNEL_ADDRESS),
            "{va} (+{len:#x}) is outside kernel VA"
        );
    }
}
