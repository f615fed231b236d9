//! # Address-Space Root Registry
//!
//! The partition table binds the (only) logical partition to the process
//! table; the process table binds each PID to the root of its radix tree.
//! The PTCR register points the hardware at the partition table.
//!
//! ```text
//!  PTCR ──► partition table (64 KiB)
//!            entry 0: [ HR | RTS | kernel root | RPDS ] [ GR | proctab | size ]
//!                                                              │
//!             ┌────────────────────────────────────────────────┘
//!             ▼
//!          process table (16 bytes per PID)
//!            PID 0: [ RTS | kernel root | RPDS ] [ 0 ]
//!            PID 1: [ RTS | user root   | RPDS ] [ 0 ]
//!            ...
//! ```
//!
//! PID 0 is the kernel: the hardware tags every quadrant-3 translation with
//! PID 0. User address spaces get PIDs from 1 upward.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;

use bitfield_struct::bitfield;
use kernel_info::memory::PARTTAB_SIZE_SHIFT;
use kernel_sync::TicketMutex;

use crate::addresses::PhysicalAddress;
use crate::config::RadixConfig;
use crate::error::{MmuError, Resource};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::tlb::{InvalidationScope, TlbInvalidate};
use crate::walk::RootTable;

/// Address-space identifier.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u32);

impl Pid {
    /// The kernel address space.
    pub const KERNEL: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First doubleword of a partition- or process-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RootDescriptor {
    /// log2 of the number of root entries.
    #[bits(5)]
    pub rpds: u8,

    /// Low three bits of the radix tree size.
    #[bits(3)]
    rts2: u8,

    /// Root table address bits 59..8.
    #[bits(52)]
    rpdb: u64,

    #[bits(1)]
    __res60: u8,

    /// High two bits of the radix tree size.
    #[bits(2)]
    rts1: u8,

    /// Host radix; only meaningful in the partition table.
    pub host_radix: bool,
}

impl RootDescriptor {
    /// Descriptor for `root` in a tree whose size field is `rts`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn for_root(root: RootTable, rts: u32) -> Self {
        Self::new()
            .with_rpds(root.index_bits() as u8)
            .with_rts1(((rts >> 3) & 0x3) as u8)
            .with_rts2((rts & 0x7) as u8)
            .with_rpdb(root.pa().as_u64() >> 8)
    }

    #[must_use]
    pub const fn root(self) -> PhysicalAddress {
        PhysicalAddress::new(self.rpdb() << 8)
    }

    /// Radix tree size field.
    #[must_use]
    pub const fn radix_tree_size(self) -> u32 {
        ((self.rts1() as u32) << 3) | self.rts2() as u32
    }
}

/// Guest radix: set in the second partition-table doubleword.
const PATB_GR: u64 = 1 << 63;

/// Next-fit bitmap of identifiers; PID 0 is permanently taken.
struct PidAllocator {
    bitmap: Vec<u64>,
    limit: usize,
    next: usize,
}

impl PidAllocator {
    fn new(pid_bits: u32) -> Self {
        let limit = 1_usize << pid_bits;
        let mut bitmap = vec![0_u64; limit.div_ceil(64)];
        bitmap[0] |= 1;
        Self {
            bitmap,
            limit,
            next: 1,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn allocate(&mut self) -> Option<Pid> {
        for _ in 0..self.limit {
            let index = self.next;
            self.next = (index + 1) % self.limit;
            let (word, bit) = (index / 64, index % 64);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(Pid(index as u32));
            }
        }
        None
    }

    fn release(&mut self, pid: Pid) {
        let index = pid.0 as usize;
        assert!(index != 0 && index < self.limit, "pid {pid} cannot be released");
        let (word, bit) = (index / 64, index % 64);
        assert!(self.bitmap[word] & (1 << bit) != 0, "pid {pid} released twice");
        self.bitmap[word] &= !(1 << bit);
    }
}

/// Partition table, process table and the PID space.
pub struct Registry {
    parttab: PhysicalAddress,
    proctab: PhysicalAddress,
    pid_bits: u32,
    proctab_shift: u32,
    rts: u32,
    pids: TicketMutex<PidAllocator>,
}

impl Registry {
    /// Allocate both tables and point partition 0 at the process table,
    /// with `host_root` as the partition's host tree.
    ///
    /// # Errors
    /// [`MmuError::OutOfMemory`] if either table cannot be allocated.
    pub fn new<V, A>(
        view: &V,
        alloc: &A,
        config: &RadixConfig,
        host_root: RootTable,
    ) -> Result<Self, MmuError>
    where
        V: PhysicalMemoryView,
        A: FrameAllocator,
    {
        let part_bytes = 1 << PARTTAB_SIZE_SHIFT;
        let parttab = alloc
            .allocate_zeroed(part_bytes, part_bytes)
            .ok_or(MmuError::OutOfMemory(Resource::Registry))?;
        let proc_bytes = config.process_table_bytes();
        let Some(proctab) = alloc.allocate_zeroed(proc_bytes, proc_bytes) else {
            alloc.free(parttab, part_bytes);
            return Err(MmuError::OutOfMemory(Resource::Registry));
        };

        let registry = Self {
            parttab,
            proctab,
            pid_bits: config.pid_bits,
            proctab_shift: config.process_table_shift(),
            rts: config.radix_tree_size(),
            pids: TicketMutex::new(PidAllocator::new(config.pid_bits)),
        };

        let words = unsafe { view.words(parttab, 2) };
        let host = RootDescriptor::for_root(host_root, registry.rts).with_host_radix(true);
        words[0].store(host.into_bits().to_be(), Ordering::Release);
        words[1].store(registry.proctab_word().to_be(), Ordering::Release);
        log::info!(
            "partition table at {parttab}, process table at {proctab} ({proc_bytes} bytes)"
        );
        Ok(registry)
    }

    /// Value for the PTCR register.
    #[must_use]
    pub const fn ptcr(&self) -> u64 {
        self.parttab.as_u64() | (PARTTAB_SIZE_SHIFT - 12) as u64
    }

    /// Second doubleword of partition-table entry 0.
    #[must_use]
    pub const fn proctab_word(&self) -> u64 {
        self.proctab.as_u64() | (self.proctab_shift - 12) as u64 | PATB_GR
    }

    #[must_use]
    pub const fn partition_table(&self) -> PhysicalAddress {
        self.parttab
    }

    #[must_use]
    pub const fn process_table(&self) -> PhysicalAddress {
        self.proctab
    }

    /// Bind `pid` to `root`.
    ///
    /// A valid previous binding is cleared and globally invalidated before
    /// the new root becomes visible.
    pub fn install<V, T>(&self, view: &V, tlb: &T, pid: Pid, root: RootTable)
    where
        V: PhysicalMemoryView,
        T: TlbInvalidate,
    {
        let words = self.entry_words(view, pid);
        let desc = RootDescriptor::for_root(root, self.rts);
        let previous = u64::from_be(words[0].swap(0, Ordering::AcqRel));
        if previous != 0 {
            log::debug!("pid {pid} rebound; invalidating stale translations");
            tlb.invalidate(pid, InvalidationScope::Global);
        }
        words[0].store(desc.into_bits().to_be(), Ordering::Release);
    }

    /// Unbind `pid` and invalidate everything cached for it.
    pub fn clear<V, T>(&self, view: &V, tlb: &T, pid: Pid)
    where
        V: PhysicalMemoryView,
        T: TlbInvalidate,
    {
        let words = self.entry_words(view, pid);
        words[0].store(0, Ordering::Release);
        tlb.invalidate(pid, InvalidationScope::Global);
    }

    /// The descriptor currently bound to `pid`.
    #[must_use]
    pub fn entry<V: PhysicalMemoryView>(&self, view: &V, pid: Pid) -> Option<RootDescriptor> {
        let raw = u64::from_be(self.entry_words(view, pid)[0].load(Ordering::Acquire));
        (raw != 0).then(|| RootDescriptor::from_bits(raw))
    }

    /// # Errors
    /// [`MmuError::PidExhausted`] when every identifier is in use.
    pub fn allocate_pid(&self) -> Result<Pid, MmuError> {
        self.pids.lock().allocate().ok_or(MmuError::PidExhausted)
    }

    /// Return `pid` to the free pool. Its registry entry must be clear.
    pub fn release_pid(&self, pid: Pid) {
        self.pids.lock().release(pid);
    }

    fn entry_words<'v, V: PhysicalMemoryView>(
        &self,
        view: &'v V,
        pid: Pid,
    ) -> &'v [core::sync::atomic::AtomicU64] {
        assert!(pid.0 < 1 << self.pid_bits, "pid {pid} outside the process table");
        unsafe { view.words(self.proctab + u64::from(pid.0) * 16, 2) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::{Event, EventLog, RecordingTlb, TestFrames, TestMemory};

    fn registry(mem: &TestMemory, frames: &TestFrames, pid_bits: u32) -> Registry {
        let root = RootTable::new(frames.allocate_zeroed(1 << 16, 1 << 16).expect("root"), 13);
        let config = RadixConfig::default().with_pid_bits(pid_bits);
        Registry::new(mem, frames, &config, root).expect("registry")
    }

    #[test]
    fn descriptor_matches_the_52_bit_encoding() {
        let root = RootTable::new(PhysicalAddress::new(0x0123_0000), 13);
        let desc = RootDescriptor::for_root(root, 21).with_host_radix(true);
        assert_eq!(
            desc.into_bits(),
            (1 << 63) | (0x2 << 61) | (0x5 << 5) | 0x0123_0000 | 13
        );
        assert_eq!(desc.root(), root.pa());
        assert_eq!(desc.radix_tree_size(), 21);
    }

    #[test]
    fn partition_entry_points_at_the_process_table() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let reg = registry(&mem, &frames, 12);

        assert_eq!(reg.ptcr(), reg.partition_table().as_u64() | 4);
        let words = unsafe { mem.words(reg.partition_table(), 2) };
        assert_eq!(
            u64::from_be(words[1].load(Ordering::Relaxed)),
            reg.process_table().as_u64() | 4 | (1 << 63)
        );
        assert!(u64::from_be(words[0].load(Ordering::Relaxed)) & (1 << 63) != 0);
    }

    #[test]
    fn rebinding_a_pid_invalidates_globally() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let log = EventLog::default();
        let tlb = RecordingTlb::new(&log);
        let reg = registry(&mem, &frames, 8);

        let pid = reg.allocate_pid().expect("pid");
        assert_eq!(pid, Pid::new(1));
        let first = RootTable::new(PhysicalAddress::new(0x10_0000), 13);
        let second = RootTable::new(PhysicalAddress::new(0x12_0000), 13);

        reg.install(&mem, &tlb, pid, first);
        assert!(log.events().is_empty());
        assert_eq!(reg.entry(&mem, pid).map(RootDescriptor::root), Some(first.pa()));

        reg.install(&mem, &tlb, pid, second);
        assert_eq!(
            log.events(),
            vec![Event::Invalidate(pid, InvalidationScope::Global)]
        );
        assert_eq!(reg.entry(&mem, pid).map(RootDescriptor::root), Some(second.pa()));

        reg.clear(&mem, &tlb, pid);
        assert_eq!(reg.entry(&mem, pid), None);
    }

    #[test]
    fn pids_run_out_and_come_back() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let reg = registry(&mem, &frames, 2);

        let pids: Vec<_> = (0..3).map(|_| reg.allocate_pid().expect("pid")).collect();
        assert_eq!(pids, vec![Pid::new(1), Pid::new(2), Pid::new(3)]);
        assert_eq!(reg.allocate_pid(), Err(MmuError::PidExhausted));

        reg.release_pid(Pid::new(2));
        assert_eq!(reg.allocate_pid(), Ok(Pid::new(2)));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_panics() {
        let mem = TestMemory::new(4 << 20);
        let frames = TestFrames::new(&mem);
        let reg = registry(&mem, &frames, 4);
        let pid = reg.allocate_pid().expect("pid");
        reg.release_pid(pid);
        reg.release_pid(pid);
    }
}
