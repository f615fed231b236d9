use core::fmt;

use crate::addresses::{PageSize, PhysicalAddress, VirtualAddress};

/// Failures reported to callers of the MMU core.
///
/// Broken invariants (a PV entry missing on remove, a corrupt table
/// pointer) are not represented here; they panic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmuError {
    #[error("out of memory allocating a {0}")]
    OutOfMemory(Resource),
    #[error("address space identifiers exhausted")]
    PidExhausted,
    #[error("address {address:#x} is not aligned to {size}")]
    Misaligned { address: u64, size: PageSize },
    #[error("{len:#x} bytes at {start} are outside the address space")]
    OutOfRange { start: VirtualAddress, len: u64 },
    #[error("frame {0} is outside the reverse-mapped range")]
    NotManaged(PhysicalAddress),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// What could not be allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resource {
    /// An intermediate or demotion table page.
    PageTable,
    /// A page of PV entries.
    PvChunk,
    /// An address-space root.
    RootTable,
    /// The partition or process table.
    Registry,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PageTable => "page-table page",
            Self::PvChunk => "pv chunk",
            Self::RootTable => "root table",
            Self::Registry => "registry table",
        })
    }
}
