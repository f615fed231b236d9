//! # Translation Cache Invalidation
//!
//! The core decides *when* cached translations must go; issuing the
//! instruction is left to an implementation of [`TlbInvalidate`].
//! [`TlbieOperands`] gives such an implementation the exact register
//! operands for `tlbie`/`tlbiel`.
//!
//! ## Rules
//!
//! - A transition from invalid to valid never needs invalidation.
//! - Any transition from a valid entry to something else must be
//!   invalidated before the lock protecting the address space is dropped,
//!   and before the frame behind it is returned to the allocator.
//! - Freeing a page-table page also requires flushing the page-walk cache,
//!   so it escalates the batch to an address-space-wide invalidation.
//!
//! ## Operand encoding (`tlbie RB,RS,RIC,PRS,R`)
//!
//! | Field | Bits (LSB = 0) | Meaning |
//! |-------|----------------|---------|
//! | `RB.EPN` | 63..12 | effective page number (page scope) |
//! | `RB.IS`  | 11..10 | 0 page, 1 PID, 2 LPID, 3 all |
//! | `RB.AP`  | 7..5   | actual page size: 0 = 4K, 5 = 64K, 1 = 2M, 2 = 1G |
//! | `RS.PID` | 63..32 | address-space identifier |
//! | `RIC`    | –      | 0 TLB, 1 page-walk cache, 2 everything |

use alloc::vec::Vec;

use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use crate::phys::FrameAllocator;
use crate::registry::Pid;

/// Number of TLB congruence classes on POWER9 in radix mode.
pub const POWER9_TLB_SETS_RADIX: u32 = 128;

/// Invalidate only TLB entries.
pub const RIC_FLUSH_TLB: u8 = 0;
/// Invalidate only page-walk cache entries.
pub const RIC_FLUSH_PWC: u8 = 1;
/// Invalidate TLB, page-walk cache and cached table entries.
pub const RIC_FLUSH_ALL: u8 = 2;

/// What an invalidation covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvalidationScope {
    /// One translation of the given size.
    Page { va: VirtualAddress, size: PageSize },
    /// Every translation and walk-cache entry tagged with the PID.
    AddressSpace,
    /// Everything, for every PID, on every processor. Required whenever the
    /// partition or process table changes.
    Global,
}

/// The invalidation primitive.
///
/// `invalidate` must reach every processor and return only once the
/// invalidation completed everywhere (`tlbie; eieio; tlbsync; ptesync`).
/// It must not block on any lock owned by this crate.
pub trait TlbInvalidate: Send + Sync {
    fn invalidate(&self, pid: Pid, scope: InvalidationScope);
}

/// Register operands for one `tlbie`/`tlbiel`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlbieOperands {
    pub rb: u64,
    pub rs: u64,
    pub ric: u8,
    /// Process-scoped (as opposed to partition-scoped) entries.
    pub prs: bool,
    /// Radix format.
    pub r: bool,
}

const IS_SHIFT: u32 = 10;
const AP_SHIFT: u32 = 5;
const SET_SHIFT: u32 = 12;

const IS_PAGE: u64 = 0;
const IS_PID: u64 = 1;
const IS_ALL: u64 = 3;

impl TlbieOperands {
    /// Operands for a broadcast `tlbie` covering `scope` for `pid`.
    #[must_use]
    pub const fn for_scope(pid: Pid, scope: InvalidationScope) -> Self {
        match scope {
            InvalidationScope::Page { va, size } => Self {
                rb: va.align_down(PageSize::Size4K).as_u64()
                    | (IS_PAGE << IS_SHIFT)
                    | (Self::actual_page_size(size) << AP_SHIFT),
                rs: (pid.as_u32() as u64) << 32,
                ric: RIC_FLUSH_TLB,
                prs: true,
                r: true,
            },
            InvalidationScope::AddressSpace => Self {
                rb: IS_PID << IS_SHIFT,
                rs: (pid.as_u32() as u64) << 32,
                ric: RIC_FLUSH_ALL,
                prs: true,
                r: true,
            },
            InvalidationScope::Global => Self {
                rb: IS_ALL << IS_SHIFT,
                rs: 0,
                ric: RIC_FLUSH_ALL,
                prs: true,
                r: true,
            },
        }
    }

    /// Operands for a local `tlbiel` of one TLB congruence class.
    #[must_use]
    pub const fn local_set(set: u32, ric: u8, prs: bool) -> Self {
        Self {
            rb: ((set as u64) << SET_SHIFT) | (IS_ALL << IS_SHIFT),
            rs: 0,
            ric,
            prs,
            r: true,
        }
    }

    /// The full local flush performed once per processor at boot: set 0
    /// with everything (walk cache and table caches included), then the
    /// remaining sets TLB-only; partition-scoped first, then process-scoped.
    pub fn local_flush_sequence(sets: u32) -> impl Iterator<Item = Self> {
        [false, true].into_iter().flat_map(move |prs| {
            (0..sets).map(move |set| {
                let ric = if set == 0 { RIC_FLUSH_ALL } else { RIC_FLUSH_TLB };
                Self::local_set(set, ric, prs)
            })
        })
    }

    const fn actual_page_size(size: PageSize) -> u64 {
        match size {
            PageSize::Size4K => 0,
            PageSize::Size2M => 1,
            PageSize::Size1G => 2,
        }
    }
}

/// Invalidations collected while an address-space lock is held.
///
/// Pages accumulate up to a ceiling, after which one address-space-wide
/// invalidation replaces them. Frames queued with
/// [`defer_free`](Self::defer_free) go back to the allocator in
/// [`release`](Self::release), which refuses to run before a
/// [`flush`](Self::flush).
pub(crate) struct InvalidationBatch {
    pid: Pid,
    ceiling: usize,
    pages: Vec<(VirtualAddress, PageSize)>,
    whole: bool,
    freed: Vec<(PhysicalAddress, u64)>,
}

impl InvalidationBatch {
    pub(crate) const fn new(pid: Pid, ceiling: usize) -> Self {
        Self {
            pid,
            ceiling,
            pages: Vec::new(),
            whole: false,
            freed: Vec::new(),
        }
    }

    pub(crate) fn page(&mut self, va: VirtualAddress, size: PageSize) {
        if self.whole {
            return;
        }
        if self.pages.len() >= self.ceiling {
            self.address_space();
        } else {
            self.pages.push((va, size));
        }
    }

    pub(crate) fn address_space(&mut self) {
        self.whole = true;
        self.pages.clear();
    }

    /// Queue a frame to be freed once the batch has been flushed.
    pub(crate) fn defer_free(&mut self, pa: PhysicalAddress, size: u64) {
        self.freed.push((pa, size));
    }

    /// Queue a page-table page. The walk caches may hold it, so the batch
    /// becomes address-space wide.
    pub(crate) fn defer_free_table(&mut self, pa: PhysicalAddress) {
        self.defer_free(pa, crate::PAGE_SIZE);
        self.address_space();
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.whole || !self.pages.is_empty()
    }

    pub(crate) fn flush<T: TlbInvalidate>(&mut self, tlb: &T) {
        if self.whole {
            log::trace!("invalidate pid {} address space", self.pid);
            tlb.invalidate(self.pid, InvalidationScope::AddressSpace);
        } else {
            for (va, size) in self.pages.drain(..) {
                log::trace!("invalidate pid {} {size} page {va}", self.pid);
                tlb.invalidate(self.pid, InvalidationScope::Page { va, size });
            }
        }
        self.whole = false;
    }

    /// Hand queued frames back to the allocator.
    pub(crate) fn release<A: FrameAllocator>(mut self, alloc: &A) {
        assert!(
            !self.is_pending(),
            "frames released before their translations were invalidated"
        );
        for (pa, size) in self.freed.drain(..) {
            alloc.free(pa, size);
        }
    }
}
