//! # Bootstrap
//!
//! Before the VM system has an allocator, the core carves the firmware's
//! memory regions into the ranges nobody else uses ([`PhysAvail`]), hands
//! out frames from them with a bump allocator ([`BootstrapAllocator`]) and
//! builds the kernel address space ([`Mmu::bootstrap`]):
//!
//! 1. the kernel root and the registry, PID 0 bound to the kernel root;
//! 2. the direct map of all memory with 1 GiB privileged RWX leaves;
//! 3. `kernel_ptp_pages` level-3 tables at the start of KVA;
//! 4. one global invalidation.
//!
//! The value for the PTCR register is then available from [`Mmu::ptcr`].

use alloc::vec::Vec;
use core::ops::Range;

use kernel_info::memory::{
    DMAP_BASE_ADDRESS, DMAP_MAX_ADDRESS, EXC_LAST, L1_PAGE_SIZE, L2_PAGE_SIZE, VM_MIN_KERNEL_ADDRESS,
};
use kernel_sync::SpinMutex;

use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::config::RadixConfig;
use crate::error::MmuError;
use crate::mmu::{EnterFlags, Mmu};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::pte::Protection;
use crate::registry::Pid;
use crate::tlb::{InvalidationScope, TlbInvalidate};

/// A range of physical memory reported by firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemRegion {
    pub start: PhysicalAddress,
    pub size: u64,
}

impl MemRegion {
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            size,
        }
    }

    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.size)
    }
}

/// What the loader tells the core about the machine.
#[derive(Clone, Debug)]
pub struct BootInfo<'a> {
    /// Physical memory, in firmware order.
    pub regions: &'a [MemRegion],
    /// Physical extent of the loaded kernel image.
    pub kernel: Range<PhysicalAddress>,
}

/// Physical memory left for allocators after the exception vectors and the
/// kernel image are taken out.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysAvail {
    ranges: Vec<Range<PhysicalAddress>>,
    physmem: u64,
    span: Option<Range<PhysicalAddress>>,
}

impl PhysAvail {
    /// Carve `regions` into available ranges.
    ///
    /// Regions are taken in order until `physmem_limit` bytes are reached;
    /// the region crossing the limit is clipped. Memory below
    /// `exception_vectors_end` and the pages of the kernel image are
    /// dropped. The result is page aligned and sorted.
    ///
    /// ```
    /// # use kernel_radix::boot::{MemRegion, PhysAvail};
    /// # use kernel_radix::PhysicalAddress as Pa;
    /// let avail = PhysAvail::carve(
    ///     &[MemRegion::new(0, 0x100_0000)],
    ///     Pa::new(0x10_0000)..Pa::new(0x30_0000),
    ///     0x3000,
    ///     None,
    /// );
    /// assert_eq!(
    ///     avail.ranges(),
    ///     [Pa::new(0x3000)..Pa::new(0x10_0000), Pa::new(0x30_0000)..Pa::new(0x100_0000)]
    /// );
    /// ```
    #[must_use]
    pub fn carve(
        regions: &[MemRegion],
        kernel: Range<PhysicalAddress>,
        exception_vectors_end: u64,
        physmem_limit: Option<u64>,
    ) -> Self {
        let kernel_start = crate::align_down(kernel.start.as_u64(), crate::PAGE_SIZE);
        let kernel_end = crate::align_up(kernel.end.as_u64(), crate::PAGE_SIZE);

        let mut physmem = 0;
        let mut span: Option<Range<u64>> = None;
        let mut ranges = Vec::new();
        for region in regions {
            let mut size = region.size;
            if let Some(limit) = physmem_limit {
                if physmem >= limit {
                    break;
                }
                size = size.min(limit - physmem);
            }
            physmem += size;

            let start = region.start.as_u64();
            let end = start + size;
            span = Some(match span {
                Some(s) => s.start.min(start)..s.end.max(end),
                None => start..end,
            });

            let start = start.max(exception_vectors_end);
            for piece in [start..end.min(kernel_start), start.max(kernel_end)..end] {
                let lo = crate::align_up(piece.start, crate::PAGE_SIZE);
                let hi = crate::align_down(piece.end, crate::PAGE_SIZE);
                if lo < hi {
                    ranges.push(PhysicalAddress::new(lo)..PhysicalAddress::new(hi));
                }
            }
        }
        ranges.sort_by_key(|r| r.start);

        Self {
            ranges,
            physmem,
            span: span.map(|s| PhysicalAddress::new(s.start)..PhysicalAddress::new(s.end)),
        }
    }

    #[must_use]
    pub fn ranges(&self) -> &[Range<PhysicalAddress>] {
        &self.ranges
    }

    /// Bytes of physical memory in use, after the limit.
    #[must_use]
    pub const fn physmem(&self) -> u64 {
        self.physmem
    }

    /// Lowest to highest address of the memory in use.
    #[must_use]
    pub fn span(&self) -> Range<PhysicalAddress> {
        self.span
            .clone()
            .unwrap_or(PhysicalAddress::new(0)..PhysicalAddress::new(0))
    }

    /// Bytes available to allocators.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }
}

/// Bump allocator over [`PhysAvail`] ranges. Frees are ignored.
pub struct BootstrapAllocator<V> {
    view: V,
    ranges: SpinMutex<Vec<Range<u64>>>,
}

impl<V: PhysicalMemoryView> BootstrapAllocator<V> {
    #[must_use]
    pub fn new(view: V, avail: &PhysAvail) -> Self {
        Self {
            view,
            ranges: SpinMutex::new(
                avail
                    .ranges()
                    .iter()
                    .map(|r| r.start.as_u64()..r.end.as_u64())
                    .collect(),
            ),
        }
    }

    /// What has not been handed out yet, for the allocator that takes over.
    #[must_use]
    pub fn remaining(&self) -> Vec<Range<PhysicalAddress>> {
        self.ranges
            .lock()
            .iter()
            .filter(|r| r.start < r.end)
            .map(|r| PhysicalAddress::new(r.start)..PhysicalAddress::new(r.end))
            .collect()
    }
}

impl<V: PhysicalMemoryView> FrameAllocator for BootstrapAllocator<V> {
    fn allocate_zeroed(&self, size: u64, align: u64) -> Option<PhysicalAddress> {
        let size = crate::align_up(size, crate::PAGE_SIZE);
        let align = align.max(crate::PAGE_SIZE);
        let pa = {
            let mut ranges = self.ranges.lock();
            let range = ranges.iter_mut().find(|r| {
                let start = crate::align_up(r.start, align);
                start.checked_add(size).is_some_and(|end| end <= r.end)
            })?;
            let start = crate::align_up(range.start, align);
            range.start = start + size;
            PhysicalAddress::new(start)
        };
        // Safety: the range was never handed out before.
        unsafe { self.view.zero(pa, size) };
        Some(pa)
    }

    fn free(&self, pa: PhysicalAddress, size: u64) {
        log::trace!("bootstrap allocator ignores free of {pa}+{size:#x}");
    }
}

impl<V, A, T> Mmu<V, A, T>
where
    V: PhysicalMemoryView,
    A: FrameAllocator,
    T: TlbInvalidate,
{
    /// Build the kernel address space for the machine described by `info`.
    ///
    /// Every frame of memory in use gets a reverse map. Frames for the
    /// tables come from `alloc`.
    ///
    /// # Errors
    /// [`MmuError::InvalidConfig`] and [`MmuError::OutOfMemory`] as for
    /// [`Mmu::new`], and [`MmuError::OutOfMemory`] while building the
    /// direct map or the kernel tables.
    pub fn bootstrap(view: V, alloc: A, tlb: T, config: RadixConfig, info: &BootInfo<'_>) -> Result<Self, MmuError> {
        let avail = PhysAvail::carve(info.regions, info.kernel.clone(), EXC_LAST, config.physmem_limit);
        let span = avail.span();
        log::info!(
            "physical memory {:#x} bytes in {}..{}, {:#x} bytes available",
            avail.physmem(),
            span.start,
            span.end,
            avail.available()
        );

        let managed = span.start.align_down(PageSize::Size4K)
            ..PhysicalAddress::new(crate::align_up(span.end.as_u64(), crate::PAGE_SIZE));
        let mmu = Self::new(view, alloc, tlb, config, managed)?;
        mmu.map_direct(span.end.as_u64())?;

        let kva_end = VM_MIN_KERNEL_ADDRESS + mmu.config.kernel_ptp_pages as u64 * L2_PAGE_SIZE;
        mmu.grow_kernel(VirtualAddress::new(kva_end))?;

        mmu.tlb.invalidate(Pid::KERNEL, InvalidationScope::Global);
        log::info!(
            "kernel address space ready, KVA backed to {}, PTCR {:#x}",
            mmu.kernel_end(),
            mmu.ptcr()
        );
        Ok(mmu)
    }

    /// Map `[0, top)` at the direct-map base with 1 GiB leaves.
    fn map_direct(&self, top: u64) -> Result<(), MmuError> {
        let limit = DMAP_MAX_ADDRESS - DMAP_BASE_ADDRESS + 1;
        let top = if top > limit {
            log::warn!("direct map truncated to {limit:#x} of {top:#x} bytes");
            limit
        } else {
            top
        };

        let mut pa = 0;
        while pa < top {
            self.enter(
                &self.kernel,
                VirtualAddress::new(DMAP_BASE_ADDRESS + pa),
                PhysicalAddress::new(pa),
                Protection::all(),
                EnterFlags::WRITE_FAULT,
                PageSize::Size1G,
            )?;
            pa += L1_PAGE_SIZE;
        }
        log::info!(
            "direct map of {} GiB at {DMAP_BASE_ADDRESS:#x}",
            pa / L1_PAGE_SIZE
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::RadixEntry;
    use crate::test_stubs::{Event, EventLog, RecordingTlb, TestMemory};
    use crate::walk::Access;

    const MIB: u64 = 1 << 20;

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn carve_splits_around_the_kernel_and_vectors() {
        let avail = PhysAvail::carve(
            &[MemRegion::new(0, 256 * MIB)],
            pa(MIB)..pa(3 * MIB + 0x10),
            EXC_LAST,
            None,
        );
        assert_eq!(
            avail.ranges(),
            [pa(EXC_LAST)..pa(MIB), pa(3 * MIB + 0x1000)..pa(256 * MIB)]
        );
        assert_eq!(avail.physmem(), 256 * MIB);
        assert_eq!(avail.span(), pa(0)..pa(256 * MIB));
    }

    #[test]
    fn carve_clips_at_the_limit_and_sorts() {
        let avail = PhysAvail::carve(
            &[MemRegion::new(16 * MIB, 16 * MIB), MemRegion::new(0, 8 * MIB)],
            pa(0x1000)..pa(0x2000),
            EXC_LAST,
            Some(20 * MIB),
        );
        assert_eq!(
            avail.ranges(),
            [pa(EXC_LAST)..pa(4 * MIB), pa(16 * MIB)..pa(32 * MIB)]
        );
        assert_eq!(avail.physmem(), 20 * MIB);
    }

    #[test]
    fn carve_drops_regions_inside_the_kernel() {
        let avail = PhysAvail::carve(
            &[MemRegion::new(0, 4 * MIB), MemRegion::new(8 * MIB, MIB)],
            pa(7 * MIB)..pa(10 * MIB),
            EXC_LAST,
            None,
        );
        assert_eq!(avail.ranges(), [pa(EXC_LAST)..pa(4 * MIB)]);
        assert_eq!(avail.span(), pa(0)..pa(9 * MIB));
    }

    #[test]
    fn bump_allocator_aligns_and_moves_on() {
        let mem = TestMemory::new(4 * MIB as usize);
        let avail = PhysAvail::carve(
            &[MemRegion::new(0, 4 * MIB)],
            pa(MIB)..pa(2 * MIB),
            EXC_LAST,
            None,
        );
        let alloc = BootstrapAllocator::new(mem.clone(), &avail);

        assert_eq!(alloc.allocate_page(), Some(pa(EXC_LAST)));
        // 64 KiB alignment skips to the next boundary
        assert_eq!(alloc.allocate_zeroed(0x1_0000, 0x1_0000), Some(pa(0x1_0000)));
        // too large for the first range, taken from the second
        assert_eq!(alloc.allocate_zeroed(MIB, MIB), Some(pa(2 * MIB)));
        assert_eq!(alloc.allocate_zeroed(4 * MIB, crate::PAGE_SIZE), None);
        assert_eq!(
            alloc.remaining(),
            [pa(0x2_0000)..pa(MIB), pa(3 * MIB)..pa(4 * MIB)]
        );
    }

    #[test]
    fn bootstrap_builds_the_direct_map_and_kva_tables() {
        let mem = TestMemory::new(64 * MIB as usize);
        let regions = [MemRegion::new(0, 64 * MIB)];
        let info = BootInfo {
            regions: &regions,
            kernel: pa(MIB)..pa(4 * MIB),
        };
        let avail = PhysAvail::carve(&regions, info.kernel.clone(), EXC_LAST, None);
        let alloc = BootstrapAllocator::new(mem.clone(), &avail);
        let log = EventLog::default();
        let config = RadixConfig::default().with_pid_bits(8).with_kernel_ptp_pages(4);

        let mmu = Mmu::bootstrap(mem, alloc, RecordingTlb::new(&log), config, &info).expect("bootstrap");
        let kernel = mmu.kernel_pmap().clone();

        // the direct map translates through the tree as well
        let va = VirtualAddress::new(DMAP_BASE_ADDRESS + 0x12_3456);
        assert_eq!(mmu.extract(&kernel, va), Some(pa(0x12_3456)));
        assert_eq!(mmu.access(&kernel, va, Access::Execute), Ok(pa(0x12_3456)));
        assert_eq!(mmu.kextract(va), Some(pa(0x12_3456)));

        // root entry 0 holds the direct map, the KVA window has 4 L3 tables
        let stats = kernel.stats();
        assert_eq!(stats.table_pages, 1 + 1 + 1 + 4);
        assert_eq!(stats.resident, PageSize::Size1G.base_pages());
        assert_eq!(
            mmu.kernel_end(),
            VirtualAddress::new(VM_MIN_KERNEL_ADDRESS + 4 * L2_PAGE_SIZE)
        );

        // PID 0 in the process table points at the kernel root
        let entry = mmu.registry().entry(mmu.view(), Pid::KERNEL).expect("kernel entry");
        assert_eq!(entry.root(), kernel.root().pa());
        assert_eq!(mmu.ptcr(), mmu.registry().partition_table().as_u64() | 4);

        assert_eq!(
            log.events().last(),
            Some(&Event::Invalidate(Pid::KERNEL, InvalidationScope::Global))
        );
    }

    #[test]
    fn kenter_after_bootstrap_needs_no_new_tables() {
        let mem = TestMemory::new(64 * MIB as usize);
        let regions = [MemRegion::new(0, 64 * MIB)];
        let info = BootInfo {
            regions: &regions,
            kernel: pa(MIB)..pa(4 * MIB),
        };
        let avail = PhysAvail::carve(&regions, info.kernel.clone(), EXC_LAST, None);
        let alloc = BootstrapAllocator::new(mem.clone(), &avail);
        let config = RadixConfig::default().with_pid_bits(8).with_kernel_ptp_pages(2);
        let mmu = Mmu::bootstrap(mem, alloc, RecordingTlb::new(&EventLog::default()), config, &info)
            .expect("bootstrap");
        let kernel = mmu.kernel_pmap().clone();
        let before = kernel.stats().table_pages;

        let va = VirtualAddress::new(VM_MIN_KERNEL_ADDRESS + 0x3000);
        mmu.kenter(va, pa(0x80_0000)).expect("kenter");
        assert_eq!(kernel.stats().table_pages, before);
        assert_eq!(mmu.kextract(va + 0x10), Some(pa(0x80_0010)));

        let (slot, _) = mmu.walker(&kernel).find_leaf(va).expect("leaf");
        let RadixEntry::Leaf(pte) = slot.entry() else {
            panic!("leaf expected");
        };
        assert!(pte.privileged());
        assert!(!pte.managed());
    }
}
