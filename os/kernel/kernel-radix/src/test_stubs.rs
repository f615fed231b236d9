//! Hosted stand-ins for physical memory, the frame allocator and the
//! invalidation primitive.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::addresses::PhysicalAddress;
use crate::phys::{FrameAllocator, PhysicalMemoryView};
use crate::registry::Pid;
use crate::tlb::{InvalidationScope, TlbInvalidate};

const ARENA_ALIGN: usize = 1 << 16;

struct Arena {
    base: *mut u8,
    layout: Layout,
}

// Safety: the arena is only reached through atomics or exclusively owned
// frames.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// A heap arena posing as physical memory starting at address 0.
#[derive(Clone)]
pub struct TestMemory {
    arena: Arc<Arena>,
}

impl TestMemory {
    pub fn new(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, ARENA_ALIGN).expect("layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test arena allocation failed");
        Self {
            arena: Arc::new(Arena { base, layout }),
        }
    }

    pub fn size(&self) -> u64 {
        self.arena.layout.size() as u64
    }
}

unsafe impl PhysicalMemoryView for TestMemory {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        unsafe { self.arena.base.add(pa.as_u64() as usize) }
    }

    fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        pa.as_u64()
            .checked_add(len)
            .is_some_and(|end| end <= self.size())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Invalidate(Pid, InvalidationScope),
    Free(PhysicalAddress),
}

/// Invalidations and frees in the order they happened.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().expect("log").push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("log").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("log").clear();
    }
}

struct FrameState {
    used: Vec<bool>,
    live: BTreeMap<u64, u64>,
}

/// First-fit page allocator over a [`TestMemory`]. Page 0 is never handed
/// out.
#[derive(Clone)]
pub struct TestFrames {
    mem: TestMemory,
    state: Arc<Mutex<FrameState>>,
    exhausted: Arc<AtomicBool>,
    log: Option<EventLog>,
}

impl TestFrames {
    pub fn new(mem: &TestMemory) -> Self {
        let pages = (mem.size() / crate::PAGE_SIZE) as usize;
        let mut used = vec![false; pages];
        used[0] = true;
        Self {
            mem: mem.clone(),
            state: Arc::new(Mutex::new(FrameState {
                used,
                live: BTreeMap::new(),
            })),
            exhausted: Arc::new(AtomicBool::new(false)),
            log: None,
        }
    }

    pub fn with_log(mem: &TestMemory, log: &EventLog) -> Self {
        Self {
            log: Some(log.clone()),
            ..Self::new(mem)
        }
    }

    /// Make every further allocation fail (or succeed again).
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Runs currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().expect("frames").live.len()
    }

    /// Mark `[pa, pa + size)` as used without handing it out, so tests can
    /// pick frames for mappings that the allocator will never reuse.
    pub fn reserve(&self, pa: PhysicalAddress, size: u64) {
        let mut state = self.state.lock().expect("frames");
        let first = (pa.as_u64() / crate::PAGE_SIZE) as usize;
        let count = (size / crate::PAGE_SIZE) as usize;
        for used in &mut state.used[first..first + count] {
            assert!(!*used, "reserved range {pa} overlaps an allocation");
            *used = true;
        }
    }
}

impl FrameAllocator for TestFrames {
    fn allocate_zeroed(&self, size: u64, align: u64) -> Option<PhysicalAddress> {
        if self.exhausted.load(Ordering::SeqCst) {
            return None;
        }
        let pages = (size.div_ceil(crate::PAGE_SIZE)) as usize;
        let step = (align.max(crate::PAGE_SIZE) / crate::PAGE_SIZE) as usize;
        let mut state = self.state.lock().expect("frames");
        let total = state.used.len();
        let mut first = 0;
        while first + pages <= total {
            if state.used[first..first + pages].iter().all(|u| !u) {
                state.used[first..first + pages].fill(true);
                let pa = PhysicalAddress::new(first as u64 * crate::PAGE_SIZE);
                state.live.insert(pa.as_u64(), size);
                drop(state);
                unsafe { self.mem.zero(pa, size) };
                return Some(pa);
            }
            first += step;
        }
        None
    }

    fn free(&self, pa: PhysicalAddress, size: u64) {
        let mut state = self.state.lock().expect("frames");
        match state.live.remove(&pa.as_u64()) {
            Some(recorded) => assert_eq!(recorded, size, "frame {pa} freed with the wrong size"),
            None => panic!("frame {pa} freed but not allocated"),
        }
        let first = (pa.as_u64() / crate::PAGE_SIZE) as usize;
        let pages = (size.div_ceil(crate::PAGE_SIZE)) as usize;
        state.used[first..first + pages].fill(false);
        drop(state);
        if let Some(log) = &self.log {
            log.push(Event::Free(pa));
        }
    }
}

/// Records every invalidation into an [`EventLog`].
#[derive(Clone)]
pub struct RecordingTlb {
    log: EventLog,
}

impl RecordingTlb {
    pub fn new(log: &EventLog) -> Self {
        Self { log: log.clone() }
    }
}

impl TlbInvalidate for RecordingTlb {
    fn invalidate(&self, pid: Pid, scope: InvalidationScope) {
        self.log.push(Event::Invalidate(pid, scope));
    }
}
