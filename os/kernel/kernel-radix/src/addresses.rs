//! # Virtual and Physical Memory Addresses
//!
//! Newtypes that keep physical and virtual addresses apart, plus the two
//! small enums every other module talks in: [`PageSize`] (what a leaf maps)
//! and [`Level`] (where in the tree an entry lives).

use core::fmt;
use core::ops::{Add, Sub};

use kernel_info::memory::{L1_PAGE_SHIFT, L2_PAGE_SHIFT, PAGE_SHIFT};

/// A **physical** memory address (machine bus address).
///
/// No alignment guarantees by itself.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// A **virtual** memory address, including the quadrant bits.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// Size of a leaf mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    /// 4 KiB base page, a level-3 leaf.
    Size4K,
    /// 2 MiB superpage, a level-2 leaf.
    Size2M,
    /// 1 GiB superpage, a level-1 leaf.
    Size1G,
}

/// Depth in the radix tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// The per-address-space root; never holds leaves.
    L0,
    L1,
    L2,
    L3,
}

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base-page frame number.
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_number(n: u64) -> Self {
        Self(n << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: PageSize) -> bool {
        self.0 & (size.bytes() - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, size: PageSize) -> Self {
        Self(crate::align_down(self.0, size.bytes()))
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, size: PageSize) -> bool {
        self.0 & (size.bytes() - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, size: PageSize) -> Self {
        Self(crate::align_down(self.0, size.bytes()))
    }

    /// Offset of this address inside a page of `size`.
    #[inline]
    #[must_use]
    pub const fn page_offset(self, size: PageSize) -> u64 {
        self.0 & (size.bytes() - 1)
    }

    /// Table index selected by this address at `level`.
    ///
    /// `root_bits` is the width of the root index; the quadrant bits above
    /// it are ignored, as the hardware walker does.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, level: Level, root_bits: u32) -> usize {
        let bits = match level {
            Level::L0 => root_bits,
            _ => crate::RPTE_SHIFT,
        };
        ((self.0 >> level.shift()) & ((1 << bits) - 1)) as usize
    }
}

impl PageSize {
    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => PAGE_SHIFT,
            Self::Size2M => L2_PAGE_SHIFT,
            Self::Size1G => L1_PAGE_SHIFT,
        }
    }

    /// Number of 4 KiB pages this size covers.
    #[inline]
    #[must_use]
    pub const fn base_pages(self) -> u64 {
        self.bytes() >> PAGE_SHIFT
    }

    /// Level at which a leaf of this size lives.
    #[inline]
    #[must_use]
    pub const fn level(self) -> Level {
        match self {
            Self::Size4K => Level::L3,
            Self::Size2M => Level::L2,
            Self::Size1G => Level::L1,
        }
    }

    /// Leaf size one level down, the result of demoting this size.
    #[inline]
    #[must_use]
    pub const fn smaller(self) -> Option<Self> {
        match self {
            Self::Size4K => None,
            Self::Size2M => Some(Self::Size4K),
            Self::Size1G => Some(Self::Size2M),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size2M => "2M",
            Self::Size1G => "1G",
        }
    }
}

impl Level {
    /// Shift of the VA slice that indexes this level.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L0 => 39,
            Self::L1 => L1_PAGE_SHIFT,
            Self::L2 => L2_PAGE_SHIFT,
            Self::L3 => PAGE_SHIFT,
        }
    }

    /// Bytes of VA covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L0 => Some(Self::L1),
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }

    /// Size of a leaf stored at this level; the root holds none.
    #[inline]
    #[must_use]
    pub const fn leaf_size(self) -> Option<PageSize> {
        match self {
            Self::L0 => None,
            Self::L1 => Some(PageSize::Size1G),
            Self::L2 => Some(PageSize::Size2M),
            Self::L3 => Some(PageSize::Size4K),
        }
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<PhysicalAddress> for PhysicalAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = u64;

    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_level_shifts() {
        let va = VirtualAddress::new(0x0000_1234_5678_9000);
        assert_eq!(va.index(Level::L3, 13), (0x0000_1234_5678_9000 >> 12) & 0x1ff);
        assert_eq!(va.index(Level::L2, 13), (0x0000_1234_5678_9000 >> 21) & 0x1ff);
        assert_eq!(va.index(Level::L1, 13), (0x0000_1234_5678_9000 >> 30) & 0x1ff);
        assert_eq!(va.index(Level::L0, 13), (0x0000_1234_5678_9000 >> 39) & 0x1fff);
    }

    #[test]
    fn quadrant_bits_do_not_reach_the_root_index() {
        let dmap = VirtualAddress::new(kernel_info::memory::DMAP_BASE_ADDRESS);
        let kva = VirtualAddress::new(kernel_info::memory::VM_MIN_KERNEL_ADDRESS);
        assert_eq!(dmap.index(Level::L0, 13), 0);
        assert_eq!(kva.index(Level::L0, 13), 0x1000);
    }

    #[test]
    fn sizes_and_levels_agree() {
        for size in [PageSize::Size4K, PageSize::Size2M, PageSize::Size1G] {
            assert_eq!(size.level().leaf_size(), Some(size));
            assert_eq!(size.level().entry_span(), size.bytes());
        }
        assert_eq!(PageSize::Size2M.base_pages(), 512);
        assert_eq!(PageSize::Size1G.smaller(), Some(PageSize::Size2M));
        assert_eq!(Level::L0.leaf_size(), None);
    }
}
