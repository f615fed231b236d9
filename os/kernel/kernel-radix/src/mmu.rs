//! # The MMU Context
//!
//! [`Mmu`] owns everything the page-table core needs: the memory view, the
//! frame allocator, the invalidation primitive, the registry, the reverse
//! maps and the kernel address space. Every operation goes through it; there
//! is no global state.
//!
//! ## Operations
//!
//! | Group | Operations |
//! |-------|------------|
//! | Mapping | [`enter`](Mmu::enter), [`remove`](Mmu::remove), [`remove_range`](Mmu::remove_range), [`protect`](Mmu::protect), [`unwire`](Mmu::unwire), [`demote`](Mmu::demote) |
//! | Lookup | [`extract`](Mmu::extract), [`access`](Mmu::access), [`kextract`](Mmu::kextract) |
//! | Kernel | [`kenter`](Mmu::kenter), [`kremove`](Mmu::kremove), [`qenter`](Mmu::qenter), [`qremove`](Mmu::qremove), [`grow_kernel`](Mmu::grow_kernel) |
//! | Per frame | [`page_init`](Mmu::page_init), [`is_modified`](Mmu::is_modified), [`is_referenced`](Mmu::is_referenced), [`ts_referenced`](Mmu::ts_referenced), [`clear_modify`](Mmu::clear_modify), [`remove_write`](Mmu::remove_write), [`remove_all`](Mmu::remove_all), [`page_wired_mappings`](Mmu::page_wired_mappings), [`page_exists_quick`](Mmu::page_exists_quick), [`mapping_count`](Mmu::mapping_count), [`mappings`](Mmu::mappings) |
//! | Lifecycle | [`create_pmap`](Mmu::create_pmap), [`destroy_pmap`](Mmu::destroy_pmap), [`activate`](Mmu::activate), [`deactivate`](Mmu::deactivate) |
//!
//! ## Invalidation
//!
//! Every operation that changes a valid entry collects the affected
//! translations in a batch while it holds the address-space lock and
//! flushes the batch before letting go of the lock. Page-table pages and PV
//! chunks freed along the way are handed back to the allocator only after
//! the flush.

mod demote;
mod enter;
mod kernel;
mod protect;
mod remove;
mod rmap;


use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use kernel_info::memory::{L2_PAGE_SIZE, VM_MIN_KERNEL_ADDRESS};
use kernel_sync::SpinMutex;

use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::config::RadixConfig;
use crate::error::{MmuError, Resource};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pmap::{Pmap, PmapState};
use crate::pte::RadixPte;
use crate::pv::{PageAttrs, PvStats, PvTable};
use crate::registry::{Pid, Registry};
use crate::table::PteSlot;
use crate::tlb::{InvalidationBatch, TlbInvalidate};
use crate::walk::{RootTable, Walker};

/// The two most significant address bits. User trees translate quadrant 0,
/// the kernel tree quadrant 3.
const QUADRANT_MASK: u64 = 0b11 << 62;

bitflags! {
    /// How [`Mmu::enter`] should treat a new mapping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct EnterFlags: u8 {
        /// Pin the mapping; counted in the wired statistics.
        const WIRED = 1 << 0;
        /// Track the mapping in the frame's reverse map.
        const MANAGED = 1 << 1;
        /// The mapping is entered to satisfy a store; mark it changed.
        const WRITE_FAULT = 1 << 2;
    }
}

/// One leaf mapping a frame, as reported by [`Mmu::mappings`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageMapping {
    pub pid: Pid,
    /// Start of the leaf.
    pub va: VirtualAddress,
    pub size: PageSize,
}

/// The page-table core.
pub struct Mmu<V, A, T> {
    view: V,
    alloc: A,
    pub(crate) tlb: T,
    pub(crate) config: RadixConfig,
    registry: Registry,
    pv: PvTable,
    pub(crate) kernel: Arc<Pmap>,
    pmaps: SpinMutex<BTreeMap<Pid, Weak<Pmap>>>,
    kernel_end: AtomicU64,
}

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Set up the registry and an empty kernel address space. Frames in
    /// `managed` get reverse maps.
    ///
    /// # Errors
    /// [`MmuError::InvalidConfig`] for a bad configuration and
    /// [`MmuError::OutOfMemory`] when the kernel root or the registry
    /// tables cannot be allocated.
    pub fn new(
        view: V,
        alloc: A,
        tlb: T,
        config: RadixConfig,
        managed: Range<PhysicalAddress>,
    ) -> Result<Self, MmuError> {
        config.validate()?;
        let root = Self::allocate_root(&alloc, &config)?;
        let registry = match Registry::new(&view, &alloc, &config, root) {
            Ok(registry) => registry,
            Err(e) => {
                alloc.free(root.pa(), root.bytes());
                return Err(e);
            }
        };
        registry.install(&view, &tlb, Pid::KERNEL, root);

        let kernel = Arc::new(Pmap::new(Pid::KERNEL, root, true));
        for cpu in 0..config.cpus {
            kernel.set_active(cpu, true);
        }
        let pv = PvTable::new(managed.start, managed.end, config.pv_lock_buckets);
        log::info!("kernel root {} ({} entries)", root.pa(), root.entries());

        Ok(Self {
            view,
            alloc,
            tlb,
            config,
            registry,
            pv,
            kernel,
            pmaps: SpinMutex::new(BTreeMap::new()),
            kernel_end: AtomicU64::new(VM_MIN_KERNEL_ADDRESS),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &RadixConfig {
        &self.config
    }

    #[must_use]
    pub const fn view(&self) -> &V {
        &self.view
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    /// Value for the PTCR register.
    #[must_use]
    pub const fn ptcr(&self) -> u64 {
        self.registry.ptcr()
    }

    #[must_use]
    pub fn pv_stats(&self) -> PvStats {
        self.pv.stats()
    }

    /// End of the kernel VA range backed by page tables.
    #[must_use]
    pub fn kernel_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.kernel_end.load(Ordering::Acquire))
    }

    /// The live address space with `pid`.
    #[must_use]
    pub fn lookup(&self, pid: Pid) -> Option<Arc<Pmap>> {
        if pid.is_kernel() {
            return Some(self.kernel.clone());
        }
        self.pmaps.lock().get(&pid).and_then(Weak::upgrade)
    }

    /// A new, empty user address space with its own PID.
    ///
    /// # Errors
    /// [`MmuError::PidExhausted`] or [`MmuError::OutOfMemory`]; nothing is
    /// left allocated on failure.
    pub fn create_pmap(&self) -> Result<Arc<Pmap>, MmuError> {
        let pid = self.registry.allocate_pid()?;
        let root = match Self::allocate_root(&self.alloc, &self.config) {
            Ok(root) => root,
            Err(e) => {
                self.registry.release_pid(pid);
                return Err(e);
            }
        };
        self.registry.install(&self.view, &self.tlb, pid, root);
        let pmap = Arc::new(Pmap::new(pid, root, false));
        self.pmaps.lock().insert(pid, Arc::downgrade(&pmap));
        log::debug!("created pid {pid} with root {}", root.pa());
        Ok(pmap)
    }

    /// Tear down a user address space.
    ///
    /// Remaining mappings are removed, page-table pages are freed after the
    /// address space is invalidated, the registry entry is cleared, the root
    /// is freed, and only then is the PID released.
    pub fn destroy_pmap(&self, pmap: Arc<Pmap>) {
        assert!(!pmap.is_kernel(), "the kernel address space is never destroyed");
        assert_eq!(
            pmap.active_cpus(),
            0,
            "pid {} destroyed while active",
            pmap.pid()
        );
        {
            let mut guard = pmap.state.lock();
            let state = &mut *guard;
            let mut batch = self.batch(&pmap);
            let end = VirtualAddress::new(1 << self.config.va_bits);
            self.visit_leaves(
                &pmap,
                state,
                &mut batch,
                VirtualAddress::new(0),
                end,
                true,
                &mut |state, batch, slot, va, size| {
                    self.remove_leaf(&pmap, state, batch, slot, va, size);
                },
            );
            batch.address_space();
            self.settle(batch);
            assert_eq!(
                state.table_pages,
                0,
                "pid {} leaked page-table pages",
                pmap.pid()
            );
            assert!(
                state.pv_chunks.is_empty(),
                "pid {} leaked pv chunks",
                pmap.pid()
            );
        }
        assert_eq!(pmap.resident.load(Ordering::Acquire), 0);

        let pid = pmap.pid();
        self.registry.clear(&self.view, &self.tlb, pid);
        self.alloc.free(pmap.root().pa(), pmap.root().bytes());
        self.registry.release_pid(pid);
        self.pmaps.lock().remove(&pid);
        log::debug!("destroyed pid {pid}");
    }

    /// Mark `pmap` loaded on `cpu`; returns the PID to put in the PIDR.
    pub fn activate(&self, pmap: &Pmap, cpu: u32) -> Pid {
        assert!(cpu < self.config.cpus, "cpu {cpu} not present");
        pmap.set_active(cpu, true);
        pmap.pid()
    }

    pub fn deactivate(&self, pmap: &Pmap, cpu: u32) {
        assert!(cpu < self.config.cpus, "cpu {cpu} not present");
        pmap.set_active(cpu, false);
    }

    fn allocate_root(alloc: &A, config: &RadixConfig) -> Result<RootTable, MmuError> {
        let bits = config.root_index_bits();
        let bytes = 8 << bits;
        let pa = alloc
            .allocate_zeroed(bytes, bytes)
            .ok_or(MmuError::OutOfMemory(Resource::RootTable))?;
        Ok(RootTable::new(pa, bits))
    }

    pub(crate) fn walker(&self, pmap: &Pmap) -> Walker<'_, V> {
        Walker::new(&self.view, pmap.root())
    }

    fn batch(&self, pmap: &Pmap) -> InvalidationBatch {
        InvalidationBatch::new(pmap.pid(), self.config.tlb_single_page_flush_ceiling)
    }

    /// Flush `batch`, then free whatever it held back.
    fn settle(&self, mut batch: InvalidationBatch) {
        batch.flush(&self.tlb);
        batch.release(&self.alloc);
    }

    /// A zeroed page-table page charged to the address space.
    fn table_page(&self, state: &mut PmapState) -> Result<PhysicalAddress, MmuError> {
        let pa = self
            .alloc
            .allocate_page()
            .ok_or(MmuError::OutOfMemory(Resource::PageTable))?;
        state.table_pages += 1;
        Ok(pa)
    }

    fn pmap_of(&self, pid: Pid) -> Arc<Pmap> {
        let Some(pmap) = self.lookup(pid) else {
            panic!("reverse map refers to pid {pid}, which does not exist");
        };
        pmap
    }

    /// Record `attrs` on the head of every base frame of a leaf.
    fn propagate(&self, frame: PhysicalAddress, size: PageSize, attrs: PageAttrs) {
        for i in 0..size.base_pages() {
            self.pv.head(frame + i * crate::PAGE_SIZE).set_attrs(attrs);
        }
    }

    /// Like [`propagate`](Self::propagate), skipping the head of `except`.
    fn propagate_except(
        &self,
        frame: PhysicalAddress,
        size: PageSize,
        except: PhysicalAddress,
        attrs: PageAttrs,
    ) {
        for i in 0..size.base_pages() {
            let base = frame + i * crate::PAGE_SIZE;
            if base != except {
                self.pv.head(base).set_attrs(attrs);
            }
        }
    }

    /// Whether `[start, end)` lies in the part of the address space that
    /// the tree of `pmap` translates. The radix index drops every bit above
    /// `va_bits`, so anything outside would alias a lower address.
    fn span_fits(&self, pmap: &Pmap, start: u64, end: u64) -> bool {
        let quadrant = if pmap.is_kernel() { QUADRANT_MASK } else { 0 };
        start <= end
            && start & QUADRANT_MASK == quadrant
            && end - quadrant <= 1 << self.config.va_bits
    }

    fn check_span(&self, pmap: &Pmap, start: VirtualAddress, len: u64) -> Result<(), MmuError> {
        match start.as_u64().checked_add(len) {
            Some(end) if self.span_fits(pmap, start.as_u64(), end) => Ok(()),
            _ => Err(MmuError::OutOfRange { start, len }),
        }
    }

    fn assert_span(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        assert!(
            self.span_fits(pmap, start.as_u64(), end.as_u64()),
            "{start}..{end} is outside the address space of pid {}",
            pmap.pid()
        );
    }

    fn check_aligned(address: u64, size: PageSize) -> Result<(), MmuError> {
        if address & (size.bytes() - 1) == 0 {
            Ok(())
        } else {
            Err(MmuError::Misaligned { address, size })
        }
    }
}

/// Atomically rewrite the leaf in `slot` with `f`, preserving whatever the
/// hardware sets in between. Returns the old and new entry.
fn update_leaf(slot: PteSlot<'_>, f: impl Fn(RadixPte) -> RadixPte) -> (RadixPte, RadixPte) {
    loop {
        let raw = slot.load();
        let crate::pte::RadixEntry::Leaf(old) = crate::pte::RadixEntry::decode(raw) else {
            panic!("leaf vanished under the address-space lock");
        };
        let new = f(old);
        if new == old || slot.compare_exchange(raw, new.into_bits()).is_ok() {
            return (old, new);
        }
    }
}

/// Move `addr` so that a mapping of `size` bytes at `addr` for an object
/// at `offset` can use 2 MiB superpages: virtual address and object offset
/// get the same alignment inside a superpage whenever the mapping is large
/// enough to contain a whole aligned superpage.
///
/// ```
/// # use kernel_radix::mmu::align_superpage;
/// # use kernel_radix::VirtualAddress;
/// let va = align_superpage(0x1000, VirtualAddress::new(0x4000_0000), 0x40_0000);
/// assert_eq!(va, VirtualAddress::new(0x4000_1000));
/// ```
#[must_use]
pub const fn align_superpage(offset: u64, addr: VirtualAddress, size: u64) -> VirtualAddress {
    const MASK: u64 = L2_PAGE_SIZE - 1;
    if size < L2_PAGE_SIZE {
        return addr;
    }
    let superpage_offset = offset & MASK;
    let addr = addr.as_u64();
    if size - ((L2_PAGE_SIZE - superpage_offset) & MASK) < L2_PAGE_SIZE
        || addr & MASK == superpage_offset
    {
        return VirtualAddress::new(addr);
    }
    if addr & MASK < superpage_offset {
        VirtualAddress::new((addr & !MASK) + superpage_offset)
    } else {
        VirtualAddress::new(((addr + MASK) & !MASK) + superpage_offset)
    }
}
