//! # Physical Memory Access and Frame Allocation
//!
//! The core never dereferences a physical address directly. Table pages,
//! PV chunks and the registry tables are reached through a
//! [`PhysicalMemoryView`], and every frame the core holds comes from, and
//! goes back to, a [`FrameAllocator`].

use core::sync::atomic::AtomicU64;

use kernel_info::memory::DMAP_BASE_ADDRESS;

use crate::addresses::PhysicalAddress;

/// A fault-free window onto physical memory.
///
/// # Safety
/// Implementors promise that for every `pa` with `contains(pa, len)`, the
/// pointer returned by [`phys_to_ptr`](Self::phys_to_ptr) is valid for
/// reads and writes of `len` bytes, stays valid for the lifetime of the
/// view, and that the same `pa` always yields the same pointer.
pub unsafe trait PhysicalMemoryView: Send + Sync {
    /// Pointer through which the byte at `pa` is reachable.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Whether `[pa, pa + len)` lies inside the window.
    fn contains(&self, pa: PhysicalAddress, len: u64) -> bool;

    /// Borrow the `T` at `pa`.
    ///
    /// # Safety
    /// `pa` must be inside the window, aligned for `T`, and the bytes
    /// there must form a valid `T` for `'a`. Only types whose shared
    /// mutation goes through atomics may be borrowed this way.
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        debug_assert!(self.contains(pa, size_of::<T>() as u64));
        unsafe { &*self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Borrow `len` consecutive 64-bit words starting at `pa`.
    ///
    /// # Safety
    /// As for [`phys_to_ref`](Self::phys_to_ref); `pa` must be 8-byte aligned.
    #[inline]
    unsafe fn words<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a [AtomicU64] {
        assert!(
            self.contains(pa, (len * 8) as u64),
            "physical range {pa}+{len} words outside the memory view"
        );
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(pa).cast::<AtomicU64>(), len) }
    }

    /// Fill `[pa, pa + len)` with zeros.
    ///
    /// # Safety
    /// Nobody may hold a reference into the range.
    #[inline]
    unsafe fn zero(&self, pa: PhysicalAddress, len: u64) {
        assert!(self.contains(pa, len));
        #[allow(clippy::cast_possible_truncation)]
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr(pa), 0, len as usize);
        }
    }
}

/// Source of physical frames.
///
/// Frames handed out are owned by the caller until returned through
/// [`free`](Self::free) with the same size. Implementations serialize
/// internally.
pub trait FrameAllocator: Send + Sync {
    /// A zero-filled, `align`-aligned run of `size` bytes, or `None` when
    /// memory is exhausted.
    fn allocate_zeroed(&self, size: u64, align: u64) -> Option<PhysicalAddress>;

    /// Return a run previously obtained from
    /// [`allocate_zeroed`](Self::allocate_zeroed).
    fn free(&self, pa: PhysicalAddress, size: u64);

    /// One zeroed 4 KiB frame.
    #[inline]
    fn allocate_page(&self) -> Option<PhysicalAddress> {
        self.allocate_zeroed(crate::PAGE_SIZE, crate::PAGE_SIZE)
    }

    #[inline]
    fn free_page(&self, pa: PhysicalAddress) {
        self.free(pa, crate::PAGE_SIZE);
    }
}

/// The kernel's direct map: physical address `pa` is visible at
/// `base | pa`.
#[derive(Copy, Clone, Debug)]
pub struct DirectMap {
    base: u64,
    limit: u64,
}

impl DirectMap {
    /// A view at [`DMAP_BASE_ADDRESS`] covering `[0, limit)`.
    ///
    /// # Safety
    /// The direct map must already translate every byte below `limit`
    /// (or the CPU must run with translation off, where the quadrant bits
    /// are ignored).
    #[must_use]
    pub const unsafe fn new(limit: u64) -> Self {
        unsafe { Self::with_base(DMAP_BASE_ADDRESS, limit) }
    }

    /// A view at an arbitrary base.
    ///
    /// # Safety
    /// As for [`new`](Self::new).
    #[must_use]
    pub const unsafe fn with_base(base: u64, limit: u64) -> Self {
        Self { base, limit }
    }
}

unsafe impl PhysicalMemoryView for DirectMap {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.base | pa.as_u64()) as *mut u8
    }

    #[inline]
    fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        pa.as_u64()
            .checked_add(len)
            .is_some_and(|end| end <= self.limit)
    }
}
