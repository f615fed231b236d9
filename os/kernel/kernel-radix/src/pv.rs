//! # Reverse Mappings
//!
//! For every managed frame the store keeps the list of leaves that map it,
//! so that a frame can be write-protected, tested or unmapped everywhere
//! without searching every address space.
//!
//! ## Granularity
//!
//! One PV entry mirrors one leaf. A superpage has a single entry keyed by
//! its aligned address and size, kept on the head of its first frame.
//! Demotion turns that entry into one entry per child leaf, each on the
//! head of the child's first frame. To find every mapping of frame `f`,
//! look at the heads of `f`, of `f` rounded down to 2 MiB and of `f`
//! rounded down to 1 GiB, keeping only entries of the matching size.
//!
//! ## Storage
//!
//! Entries live in page-sized [chunks](chunk) owned by one address space;
//! an entry never needs a heap allocation. Each address space keeps its
//! chunks most-recently-used first with full chunks at the tail, so the
//! front chunk is the one to allocate from and freeing into any chunk is
//! cheap. A chunk that becomes empty goes back to the frame allocator.
//!
//! ## Locking
//!
//! Heads are protected by a fixed array of reader/writer locks, hashed by
//! the 2 MiB region of the frame: a superpage head and the heads of its
//! base frames always share a lock. The chunk list of an address space is
//! protected by that address space's lock. Statistics have their own lock.

mod chunk;
mod head;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::hint::spin_loop;
use core::sync::atomic::{Ordering, fence};

use kernel_sync::{RwLock, SpinMutex};

use crate::addresses::{PageSize, PhysicalAddress};
use crate::error::{MmuError, Resource};
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::registry::Pid;

pub(crate) use chunk::{PV_CHUNK_ENTRIES, PvChunk, PvEntry, PvKey, PvRef};
pub use head::PageAttrs;
pub(crate) use head::PvHead;

/// Longest list a lock-free reader follows before assuming it strayed onto
/// recycled entries.
const LOCKLESS_WALK_LIMIT: usize = 1 << 20;

/// Chunk and entry accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PvStats {
    /// Chunks currently held by address spaces.
    pub chunks: u64,
    /// Chunks taken from the frame allocator since boot.
    pub chunk_allocs: u64,
    /// Chunks returned to the frame allocator since boot.
    pub chunk_frees: u64,
    /// Entries in use.
    pub entries: u64,
    /// Free entries inside held chunks.
    pub spare: u64,
}

pub(crate) struct PvTable {
    start: u64,
    end: u64,
    heads: Box<[PvHead]>,
    locks: Box<[RwLock<()>]>,
    stats: SpinMutex<PvStats>,
}

impl PvTable {
    /// Reverse maps for the frames in `[start, end)`, guarded by `buckets`
    /// locks.
    pub(crate) fn new(start: PhysicalAddress, end: PhysicalAddress, buckets: usize) -> Self {
        let start = crate::align_down(start.as_u64(), crate::PAGE_SIZE);
        let end = crate::align_up(end.as_u64(), crate::PAGE_SIZE);
        #[allow(clippy::cast_possible_truncation)]
        let frames = ((end - start) / crate::PAGE_SIZE) as usize;
        log::debug!(
            "reverse map covers {:#x}..{:#x}: {frames} heads, {buckets} locks",
            start,
            end
        );
        Self {
            start,
            end,
            heads: (0..frames).map(|_| PvHead::new()).collect(),
            locks: (0..buckets.max(1)).map(|_| RwLock::new(())).collect(),
            stats: SpinMutex::new(PvStats::default()),
        }
    }

    /// Whether every frame of `[pa, pa + size)` has a head.
    pub(crate) fn manages(&self, pa: PhysicalAddress, size: u64) -> bool {
        pa.as_u64() >= self.start
            && pa
                .as_u64()
                .checked_add(size)
                .is_some_and(|end| end <= self.end)
    }

    pub(crate) fn head(&self, pa: PhysicalAddress) -> &PvHead {
        assert!(self.manages(pa, 1), "frame {pa} has no reverse map");
        #[allow(clippy::cast_possible_truncation)]
        let index = ((pa.as_u64() - self.start) / crate::PAGE_SIZE) as usize;
        &self.heads[index]
    }

    /// The bucket lock covering the head of `pa`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn lock(&self, pa: PhysicalAddress) -> &RwLock<()> {
        let bucket = (pa.as_u64() >> PageSize::Size2M.shift()) as usize % self.locks.len();
        &self.locks[bucket]
    }

    pub(crate) fn entry<V: PhysicalMemoryView>(view: &V, r: PvRef) -> &PvEntry {
        Self::chunk(view, r.chunk()).entry(r.slot())
    }

    pub(crate) fn chunk<V: PhysicalMemoryView>(view: &V, pa: PhysicalAddress) -> &PvChunk {
        // Safety: chunk pages stay inside the view and are only touched
        // through atomics.
        unsafe { view.phys_to_ref(pa) }
    }

    pub(crate) fn owner<V: PhysicalMemoryView>(view: &V, r: PvRef) -> Pid {
        Self::chunk(view, r.chunk()).owner()
    }

    /// Append `r` to `head`. The bucket lock must be held for writing.
    pub(crate) fn link<V: PhysicalMemoryView>(view: &V, head: &PvHead, r: PvRef, key: PvKey) {
        let entry = Self::entry(view, r);
        let last = head.last();
        entry.set_key(key);
        entry.next.store(PvRef::NIL.raw(), Ordering::Relaxed);
        entry.prev.store(last.raw(), Ordering::Relaxed);

        head.begin();
        if last.is_nil() {
            head.set_first(r);
        } else {
            Self::entry(view, last).next.store(r.raw(), Ordering::Release);
        }
        head.set_last(r);
        head.end();
    }

    /// Remove `r` from `head`. The bucket lock must be held for writing.
    pub(crate) fn unlink<V: PhysicalMemoryView>(view: &V, head: &PvHead, r: PvRef) {
        let entry = Self::entry(view, r);
        let (prev, next) = (entry.prev(), entry.next());

        head.begin();
        if prev.is_nil() {
            head.set_first(next);
        } else {
            Self::entry(view, prev).next.store(next.raw(), Ordering::Release);
        }
        if next.is_nil() {
            head.set_last(prev);
        } else {
            Self::entry(view, next).prev.store(prev.raw(), Ordering::Release);
        }
        head.end();
    }

    /// Every entry on `head`. The bucket lock must be held.
    pub(crate) fn iter<'v, V: PhysicalMemoryView>(
        view: &'v V,
        head: &PvHead,
    ) -> impl Iterator<Item = (PvRef, PvKey)> + 'v {
        let mut cursor = head.first();
        core::iter::from_fn(move || {
            if cursor.is_nil() {
                return None;
            }
            let current = cursor;
            let entry = Self::entry(view, current);
            cursor = entry.next();
            Some((current, entry.key()))
        })
    }

    /// The entry of `owner` for `key` on `head`. The bucket lock must be
    /// held.
    pub(crate) fn find<V: PhysicalMemoryView>(
        view: &V,
        head: &PvHead,
        owner: Pid,
        key: PvKey,
    ) -> Option<PvRef> {
        Self::iter(view, head)
            .find(|&(r, k)| k == key && Self::owner(view, r) == owner)
            .map(|(r, _)| r)
    }

    /// Entries of `size` on `head`, counted without any lock.
    pub(crate) fn count_lockless<V: PhysicalMemoryView>(
        view: &V,
        head: &PvHead,
        size: PageSize,
    ) -> usize {
        'retry: loop {
            let generation = head.generation();
            if generation % 2 == 1 {
                spin_loop();
                continue;
            }
            let mut count = 0;
            let mut cursor = head.first();
            let mut steps = 0;
            while !cursor.is_nil() {
                steps += 1;
                if steps > LOCKLESS_WALK_LIMIT
                    || !cursor.is_well_formed()
                    || !view.contains(cursor.chunk(), crate::PAGE_SIZE)
                {
                    spin_loop();
                    continue 'retry;
                }
                let entry = Self::entry(view, cursor);
                if entry.key().size() == size {
                    count += 1;
                }
                cursor = entry.next();
            }
            fence(Ordering::Acquire);
            if head.generation() == generation {
                return count;
            }
        }
    }

    /// Take a free entry for `owner`, growing its chunk list if needed.
    pub(crate) fn allocate<V, A>(
        &self,
        view: &V,
        alloc: &A,
        chunks: &mut VecDeque<PhysicalAddress>,
        owner: Pid,
    ) -> Result<PvRef, MmuError>
    where
        V: PhysicalMemoryView,
        A: FrameAllocator,
    {
        let front = chunks
            .front()
            .copied()
            .filter(|&pa| !Self::chunk(view, pa).is_full());
        let pa = match front {
            Some(pa) => pa,
            None => {
                let pa = self.new_chunk(view, alloc, owner)?;
                chunks.push_front(pa);
                pa
            }
        };
        Ok(self.take_from(view, chunks, pa))
    }

    /// Make sure `owner` has at least `count` free entries so that the
    /// next `count` calls to [`allocate_reserved`](Self::allocate_reserved)
    /// cannot fail. Nothing is taken on failure.
    pub(crate) fn reserve<V, A>(
        &self,
        view: &V,
        alloc: &A,
        chunks: &mut VecDeque<PhysicalAddress>,
        owner: Pid,
        count: usize,
    ) -> Result<(), MmuError>
    where
        V: PhysicalMemoryView,
        A: FrameAllocator,
    {
        let mut free: usize = chunks
            .iter()
            .map(|&pa| Self::chunk(view, pa).free_slots() as usize)
            .sum();
        let mut added = alloc::vec::Vec::new();
        while free < count {
            match self.new_chunk(view, alloc, owner) {
                Ok(pa) => {
                    added.push(pa);
                    free += PV_CHUNK_ENTRIES;
                }
                Err(e) => {
                    for pa in added {
                        self.retire(pa);
                        alloc.free_page(pa);
                    }
                    return Err(e);
                }
            }
        }
        for pa in added {
            chunks.push_front(pa);
        }
        Ok(())
    }

    /// Take an entry reserved earlier with [`reserve`](Self::reserve).
    pub(crate) fn allocate_reserved<V: PhysicalMemoryView>(
        &self,
        view: &V,
        chunks: &mut VecDeque<PhysicalAddress>,
    ) -> PvRef {
        let Some(pa) = chunks
            .iter()
            .copied()
            .find(|&pa| !Self::chunk(view, pa).is_full())
        else {
            panic!("pv reservation exhausted");
        };
        self.take_from(view, chunks, pa)
    }

    /// Give `r` back to its chunk. Returns the chunk's page when the chunk
    /// became empty; it is off the list and must be handed to the frame
    /// allocator by the caller.
    pub(crate) fn free<V: PhysicalMemoryView>(
        &self,
        view: &V,
        chunks: &mut VecDeque<PhysicalAddress>,
        r: PvRef,
    ) -> Option<PhysicalAddress> {
        let pa = r.chunk();
        let chunk = Self::chunk(view, pa);
        let was_full = chunk.is_full();
        chunk.put(r.slot());
        {
            let mut stats = self.stats.lock();
            stats.entries -= 1;
            stats.spare += 1;
        }

        let Some(position) = chunks.iter().position(|&c| c == pa) else {
            panic!("pv chunk {pa} not owned by the freeing address space");
        };
        if chunk.is_empty() {
            chunks.remove(position);
            self.retire(pa);
            return Some(pa);
        }
        if was_full {
            chunks.remove(position);
            chunks.push_front(pa);
        }
        None
    }

    pub(crate) fn stats(&self) -> PvStats {
        *self.stats.lock()
    }

    fn take_from<V: PhysicalMemoryView>(
        &self,
        view: &V,
        chunks: &mut VecDeque<PhysicalAddress>,
        pa: PhysicalAddress,
    ) -> PvRef {
        let chunk = Self::chunk(view, pa);
        let Some(slot) = chunk.take() else {
            panic!("pv chunk {pa} has no free entry");
        };
        if chunk.is_full()
            && let Some(position) = chunks.iter().position(|&c| c == pa)
        {
            chunks.remove(position);
            chunks.push_back(pa);
        }
        let mut stats = self.stats.lock();
        stats.entries += 1;
        stats.spare -= 1;
        PvRef::at(pa, slot)
    }

    fn new_chunk<V, A>(&self, view: &V, alloc: &A, owner: Pid) -> Result<PhysicalAddress, MmuError>
    where
        V: PhysicalMemoryView,
        A: FrameAllocator,
    {
        let pa = alloc
            .allocate_page()
            .ok_or(MmuError::OutOfMemory(Resource::PvChunk))?;
        Self::chunk(view, pa).init(owner);
        let mut stats = self.stats.lock();
        stats.chunks += 1;
        stats.chunk_allocs += 1;
        stats.spare += PV_CHUNK_ENTRIES as u64;
        log::debug!("pv chunk {pa} for pid {owner}");
        Ok(pa)
    }

    fn retire(&self, pa: PhysicalAddress) {
        let mut stats = self.stats.lock();
        stats.chunks -= 1;
        stats.chunk_frees += 1;
        stats.spare -= PV_CHUNK_ENTRIES as u64;
        log::debug!("pv chunk {pa} released");
    }
}
