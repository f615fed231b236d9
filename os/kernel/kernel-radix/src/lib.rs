//! # Radix MMU Page-Table Management
//!
//! Software side of a radix-tree MMU in the style of Power ISA 3.0: it keeps
//! the hardware page tables, the reverse mappings from physical frames back
//! to virtual mappings, and the translation caches consistent while many
//! processors map, unmap and re-protect memory concurrently.
//!
//! ## Radix Tree Layout
//!
//! Every address space owns one tree of four levels. The root is sized by
//! the number of supported virtual address bits (`va_bits`); all lower
//! levels have [`RPTE_ENTRIES`] entries of 8 bytes (one 4 KiB page).
//!
//! | Level | VA bits (52-bit) | Entries | Leaf size |
//! |-------|------------------|---------|-----------|
//! | L0 (root) | 51..39 | `1 << (va_bits - 39)` | – |
//! | L1 | 38..30 | 512 | 1 GiB |
//! | L2 | 29..21 | 512 | 2 MiB |
//! | L3 | 20..12 | 512 | 4 KiB |
//!
//! ```text
//!  VA:  [ quadrant | L0 idx | L1 idx | L2 idx | L3 idx | offset ]
//!                       │        │        │        │
//!  root ──────────► L0[i] ──► L1[j] ──► L2[k] ──► L3[l] ──► 4 KiB frame
//!                             │ leaf     │ leaf
//!                             ▼          ▼
//!                          1 GiB       2 MiB
//! ```
//!
//! Entries are stored big-endian, exactly as the hardware walker reads them.
//! In software they are decoded into [`RadixEntry`] before anyone reasons
//! about them.
//!
//! ## Crate Structure
//!
//! - [`addresses`]: typed physical/virtual addresses, [`PageSize`], [`Level`].
//! - [`pte`]: hardware entry layouts and the decoded [`RadixEntry`].
//! - [`phys`]: the [`PhysicalMemoryView`] and [`FrameAllocator`] seams.
//! - [`tlb`]: the [`TlbInvalidate`] primitive and `tlbie` operand encoding.
//! - [`registry`]: partition and process tables, PID allocation.
//! - [`pv`]: the reverse-mapping store backed by page-sized chunks.
//! - [`mmu`]: the [`Mmu`] context with every mapping operation.
//! - [`boot`]: physical memory carving and one-time bootstrap.
//!
//! ## Locking
//!
//! Each [`Pmap`] has one spin lock serializing structural changes to its
//! tables and its PV chunk list. Reverse-map lists are protected by a fixed
//! array of hashed reader/writer locks. A global lock guards the chunk pool.
//! Locks are always taken in that order: pmap, bucket, pool.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod boot;
mod config;
mod error;
pub mod mmu;
pub mod phys;
mod pmap;
pub mod pte;
pub mod pv;
pub mod registry;
mod table;
pub mod tlb;
mod walk;

#[cfg(test)]
mod test_stubs;

pub use addresses::{Level, PageSize, PhysicalAddress, VirtualAddress};
pub use config::RadixConfig;
pub use error::{MmuError, Resource};
pub use mmu::{EnterFlags, Mmu, PageMapping};
pub use phys::{DirectMap, FrameAllocator, PhysicalMemoryView};
pub use pmap::{Pmap, PmapStats};
pub use pte::{Protection, RadixEntry, RadixPde, RadixPte};
pub use registry::Pid;
pub use tlb::{InvalidationScope, TlbInvalidate, TlbieOperands};
pub use walk::{Access, Fault, RootTable};

/// log2 of the number of entries in a non-root table.
pub const RPTE_SHIFT: u32 = 9;

/// Entries in a non-root table.
pub const RPTE_ENTRIES: usize = 1 << RPTE_SHIFT;

/// Base page size.
pub const PAGE_SIZE: u64 = kernel_info::memory::PAGE_SIZE;

/// Align `x` down to `align` (power of two).
///
/// # Example
/// ```
/// # use kernel_radix::align_down;
/// assert_eq!(align_down(0x20_1234, 0x20_0000), 0x20_0000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

/// Align `x` up to `align` (power of two).
///
/// # Example
/// ```
/// # use kernel_radix::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}
