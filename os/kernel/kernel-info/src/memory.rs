//! # Memory Layout

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Level-2 leaf (superpage) shift, 2 MiB.
pub const L2_PAGE_SHIFT: u32 = 21;

/// Level-2 leaf (superpage) size.
pub const L2_PAGE_SIZE: u64 = 1 << L2_PAGE_SHIFT;

/// Level-1 leaf (giant page) shift, 1 GiB.
pub const L1_PAGE_SHIFT: u32 = 30;

/// Level-1 leaf (giant page) size.
pub const L1_PAGE_SIZE: u64 = 1 << L1_PAGE_SHIFT;

/// Bytes covered by one root (level-0) entry, 512 GiB.
pub const L0_ENTRY_SPAN: u64 = 1 << 39;

/// Highest user virtual address (quadrant 0, 52 significant bits).
pub const VM_MAXUSER_ADDRESS: u64 = 0x000f_ffff_ffff_ffff;

/// Base of the direct map: physical address `pa` is reachable at
/// [`DMAP_BASE_ADDRESS`] `| pa`.
pub const DMAP_BASE_ADDRESS: u64 = 0xc000_0000_0000_0000;

/// Last address covered by the direct map.
pub const DMAP_MAX_ADDRESS: u64 = 0xc007_ffff_ffff_ffff;

/// First kernel virtual address handed out for dynamic mappings.
pub const VM_MIN_KERNEL_ADDRESS: u64 = 0xc008_0000_0000_0000;

/// Last kernel virtual address.
pub const VM_MAX_KERNEL_ADDRESS: u64 = 0xc00f_ffff_ffff_ffff;

/// End of the exception vectors at the bottom of physical memory. Memory
/// below this is never handed to an allocator.
pub const EXC_LAST: u64 = 0x3000;

/// Number of significant virtual address bits in a radix tree.
pub const DEFAULT_VA_BITS: u32 = 52;

/// Width of the address-space identifier (PID). The process table holds
/// `1 << DEFAULT_PID_BITS` entries of 16 bytes each.
pub const DEFAULT_PID_BITS: u32 = 12;

/// Number of hashed locks protecting reverse-map lists.
pub const DEFAULT_PV_LOCK_BUCKETS: usize = 256;

/// Single-page invalidations batched before one address-space-wide
/// invalidation is cheaper.
pub const DEFAULT_TLB_FLUSH_CEILING: usize = 33;

/// Level-3 page-table pages preallocated for the start of KVA (128 MiB).
pub const DEFAULT_KERNEL_PTP_PAGES: usize = 64;

/// log2 of the partition table size (64 KiB).
pub const PARTTAB_SIZE_SHIFT: u32 = 16;

const _: () = {
    assert!(DMAP_BASE_ADDRESS > VM_MAXUSER_ADDRESS);
    assert!(DMAP_MAX_ADDRESS < VM_MIN_KERNEL_ADDRESS);
    assert!(VM_MIN_KERNEL_ADDRESS.is_multiple_of(L0_ENTRY_SPAN));
    assert!(DEFAULT_VA_BITS > 39 && DEFAULT_VA_BITS <= 52);
    assert!(DEFAULT_PID_BITS > 0 && DEFAULT_PID_BITS <= 20);
    assert!(DEFAULT_PV_LOCK_BUCKETS > 0);
    assert!(EXC_LAST.is_multiple_of(PAGE_SIZE));
    assert!((DEFAULT_KERNEL_PTP_PAGES as u64) * L2_PAGE_SIZE <= L1_PAGE_SIZE);
};
