//! # Radix Page Table Entries
//!
//! Hardware layouts of the two kinds of radix entries and the decoded form
//! used everywhere else in the crate.
//!
//! Bit numbers below count from the least significant bit. The Power ISA
//! manuals number from the most significant bit; `valid` is "bit 0" there.
//!
//! ### Leaf entry ([`RadixPte`])
//!
//! | Bits   | Name | Meaning |
//! |--------|------|---------|
//! | 0      | `X`  | instruction fetch allowed |
//! | 1      | `W`  | stores allowed |
//! | 2      | `R`  | loads allowed |
//! | 3      | `P`  | privileged (kernel) access only |
//! | 4–5    | `ATT`| memory attribute (0 = normal cacheable) |
//! | 7      | `C`  | changed; set by hardware on store |
//! | 8      | `R`  | referenced; set by hardware on access |
//! | 9–11   | SW   | promoted, wired, managed (software use) |
//! | 12–55  | `RPN`| frame number |
//! | 61     | SW0  | software use |
//! | 62     | `L`  | leaf; always 1 |
//! | 63     | `V`  | valid |
//!
//! ### Non-leaf entry ([`RadixPde`])
//!
//! | Bits   | Name | Meaning |
//! |--------|------|---------|
//! | 0–4    | `NLS`| log2 of next-level entries, always [`RPTE_SHIFT`](crate::RPTE_SHIFT) |
//! | 8–59   | `NLB`| next-level table address bits 59..8 |
//! | 62     | `L`  | leaf; always 0 |
//! | 63     | `V`  | valid |
//!
//! Reasoning happens on [`RadixEntry`]; the bitfields are only touched when
//! an entry is decoded from or encoded to table memory.

use bitfield_struct::bitfield;
use bitflags::bitflags;

use crate::addresses::PhysicalAddress;

bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const NONE: Self = Self::empty();
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

/// A leaf radix entry: maps a frame of the size implied by its level.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RadixPte {
    /// Execute permission (EAA bit X).
    pub execute: bool,

    /// Write permission (EAA bit W). Software always pairs it with `read`.
    pub write: bool,

    /// Read permission (EAA bit R).
    pub read: bool,

    /// Privileged: only supervisor-state accesses are allowed.
    pub privileged: bool,

    /// Memory attribute (`ATT`). Zero for normal cacheable memory.
    #[bits(2)]
    pub attribute: u8,

    #[bits(1)]
    __res6: u8,

    /// Changed (`C`): a store went through this translation.
    pub changed: bool,

    /// Referenced (`R`): any access went through this translation.
    pub referenced: bool,

    /// Software: mapping was created by promoting base pages.
    pub promoted: bool,

    /// Software: mapping is wired and must not be reclaimed.
    pub wired: bool,

    /// Software: mapping has a PV entry in the reverse-map store.
    pub managed: bool,

    #[bits(44)]
    rpn: u64,

    #[bits(5)]
    __res56: u8,

    /// Software bit 0; unused by this crate, preserved on updates.
    pub sw0: bool,

    /// Leaf indicator; always set for this type.
    pub leaf: bool,

    /// Valid bit.
    pub valid: bool,
}

/// A non-leaf radix entry: points to the next-level table.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RadixPde {
    /// log2 of the number of entries in the next-level table.
    #[bits(5)]
    pub next_level_size: u8,

    #[bits(3)]
    __res5: u8,

    #[bits(52)]
    nlb: u64,

    #[bits(2)]
    __res60: u8,

    /// Leaf indicator; always clear for this type.
    pub leaf: bool,

    /// Valid bit.
    pub valid: bool,
}

/// A decoded radix entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RadixEntry {
    /// Valid bit clear. The hardware ignores every other bit.
    Invalid,
    /// Points at the next-level table.
    Table(PhysicalAddress),
    /// Maps a frame.
    Leaf(RadixPte),
}

impl RadixPte {
    /// A valid leaf for `frame` with the given permissions and no other bits.
    #[inline]
    #[must_use]
    pub fn new_leaf(frame: PhysicalAddress, prot: Protection) -> Self {
        Self::new()
            .with_valid(true)
            .with_leaf(true)
            .with_frame(frame)
            .with_protection(prot)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.rpn())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalAddress) -> Self {
        self.with_rpn(frame.frame_number())
    }

    /// Permissions granted by the EAA bits.
    #[must_use]
    pub fn protection(self) -> Protection {
        let mut prot = Protection::NONE;
        prot.set(Protection::READ, self.read());
        prot.set(Protection::WRITE, self.write());
        prot.set(Protection::EXECUTE, self.execute());
        prot
    }

    /// Replaces the EAA bits. Write permission implies read permission.
    #[must_use]
    pub fn with_protection(self, prot: Protection) -> Self {
        self.with_read(prot.intersects(Protection::READ_WRITE))
            .with_write(prot.contains(Protection::WRITE))
            .with_execute(prot.contains(Protection::EXECUTE))
    }

    /// A store went through a writeable translation.
    #[inline]
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        self.changed() && self.write()
    }

    /// Raw bits with the hardware-maintained `R`/`C` bits masked off.
    #[inline]
    #[must_use]
    pub const fn without_refmod(self) -> u64 {
        self.with_referenced(false).with_changed(false).into_bits()
    }
}

impl RadixPde {
    /// A valid non-leaf entry for a table of [`RPTE_ENTRIES`](crate::RPTE_ENTRIES).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new_table(table: PhysicalAddress) -> Self {
        Self::new()
            .with_valid(true)
            .with_next_level_size(crate::RPTE_SHIFT as u8)
            .with_nlb(table.as_u64() >> 8)
    }

    #[inline]
    #[must_use]
    pub const fn table(self) -> PhysicalAddress {
        PhysicalAddress::new(self.nlb() << 8)
    }
}

impl RadixEntry {
    #[inline]
    #[must_use]
    pub const fn decode(raw: u64) -> Self {
        let pde = RadixPde::from_bits(raw);
        if !pde.valid() {
            Self::Invalid
        } else if pde.leaf() {
            Self::Leaf(RadixPte::from_bits(raw))
        } else {
            Self::Table(pde.table())
        }
    }

    #[inline]
    #[must_use]
    pub const fn encode(self) -> u64 {
        match self {
            Self::Invalid => 0,
            Self::Table(table) => RadixPde::new_table(table).into_bits(),
            Self::Leaf(pte) => pte.into_bits(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}
