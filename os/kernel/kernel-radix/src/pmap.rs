//! Address spaces.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use kernel_sync::SpinMutex;

use crate::addresses::PhysicalAddress;
use crate::registry::Pid;
use crate::walk::RootTable;

/// One address space: a radix tree, its identifier and its bookkeeping.
///
/// The lock inside serializes every structural change to the tree and to
/// the PV chunk list. Counters are atomics so they can be read without it.
pub struct Pmap {
    pid: Pid,
    root: RootTable,
    kernel: bool,
    pub(crate) state: SpinMutex<PmapState>,
    pub(crate) resident: AtomicU64,
    pub(crate) wired: AtomicU64,
    active: AtomicU64,
}

/// Guarded by the address-space lock.
pub(crate) struct PmapState {
    /// Page-table pages below the root.
    pub(crate) table_pages: u64,
    /// PV chunks, most recently used first, full chunks last.
    pub(crate) pv_chunks: VecDeque<PhysicalAddress>,
}

/// Snapshot of an address space's counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PmapStats {
    /// Base pages mapped by leaves.
    pub resident: u64,
    /// Base pages mapped by wired leaves.
    pub wired: u64,
    /// Page-table pages, root excluded.
    pub table_pages: u64,
}

impl Pmap {
    pub(crate) const fn new(pid: Pid, root: RootTable, kernel: bool) -> Self {
        Self {
            pid,
            root,
            kernel,
            state: SpinMutex::new(PmapState {
                table_pages: 0,
                pv_chunks: VecDeque::new(),
            }),
            resident: AtomicU64::new(0),
            wired: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub const fn root(&self) -> RootTable {
        self.root
    }

    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Processors on which this address space is loaded, one bit each.
    #[must_use]
    pub fn active_cpus(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, cpu: u32, active: bool) {
        assert!(cpu < 64, "cpu {cpu} out of range");
        if active {
            self.active.fetch_or(1 << cpu, Ordering::AcqRel);
        } else {
            self.active.fetch_and(!(1 << cpu), Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn stats(&self) -> PmapStats {
        let table_pages = self.state.lock().table_pages;
        PmapStats {
            resident: self.resident.load(Ordering::Acquire),
            wired: self.wired.load(Ordering::Acquire),
            table_pages,
        }
    }
}
