//! Per-frame reverse-map heads.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use bitflags::bitflags;

use super::chunk::PvRef;

bitflags! {
    /// Page state accumulated from mappings that no longer exist, or whose
    /// hardware bits were cleared.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct PageAttrs: u8 {
        /// A store reached the frame through some mapping.
        const DIRTY = 1 << 0;
        /// Some mapping of the frame was used.
        const REFERENCED = 1 << 1;
    }
}

/// Head of one frame's reverse-map list.
///
/// Writers hold the frame's bucket lock exclusively and bracket every
/// structural change with [`begin`](Self::begin)/[`end`](Self::end), which
/// turn the generation odd and back to even. Lock-free readers sample the
/// generation before and after a traversal and retry on any change.
pub(crate) struct PvHead {
    first: AtomicU64,
    last: AtomicU64,
    generation: AtomicU64,
    attrs: AtomicU8,
}

impl PvHead {
    pub(crate) const fn new() -> Self {
        Self {
            first: AtomicU64::new(PvRef::NIL.raw()),
            last: AtomicU64::new(PvRef::NIL.raw()),
            generation: AtomicU64::new(0),
            attrs: AtomicU8::new(0),
        }
    }

    pub(crate) fn first(&self) -> PvRef {
        PvRef::from_raw(self.first.load(Ordering::Acquire))
    }

    pub(crate) fn last(&self) -> PvRef {
        PvRef::from_raw(self.last.load(Ordering::Acquire))
    }

    pub(super) fn set_first(&self, r: PvRef) {
        self.first.store(r.raw(), Ordering::Release);
    }

    pub(super) fn set_last(&self, r: PvRef) {
        self.last.store(r.raw(), Ordering::Release);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first().is_nil()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(super) fn begin(&self) {
        let g = self.generation.fetch_add(1, Ordering::AcqRel);
        debug_assert!(g % 2 == 0, "nested reverse-map update");
        core::sync::atomic::fence(Ordering::Release);
    }

    pub(super) fn end(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn attrs(&self) -> PageAttrs {
        PageAttrs::from_bits_truncate(self.attrs.load(Ordering::Acquire))
    }

    pub(crate) fn set_attrs(&self, attrs: PageAttrs) {
        self.attrs.fetch_or(attrs.bits(), Ordering::AcqRel);
    }

    /// Clear `attrs`, returning what was set before.
    pub(crate) fn take_attrs(&self, attrs: PageAttrs) -> PageAttrs {
        PageAttrs::from_bits_truncate(self.attrs.fetch_and(!attrs.bits(), Ordering::AcqRel))
    }

    /// Forget the accumulated attributes; the frame must have no mappings.
    /// The generation keeps counting so a lock-free reader that sampled it
    /// before the reset never sees it repeat.
    pub(crate) fn reset(&self) {
        assert!(self.is_empty(), "reverse-map head reset while mapped");
        self.attrs.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_odd_only_inside_an_update() {
        let head = PvHead::new();
        assert!(head.is_empty());
        head.begin();
        assert_eq!(head.generation() % 2, 1);
        head.end();
        assert_eq!(head.generation(), 2);
    }

    #[test]
    fn attrs_accumulate_and_clear() {
        let head = PvHead::new();
        head.set_attrs(PageAttrs::DIRTY);
        head.set_attrs(PageAttrs::REFERENCED);
        assert_eq!(head.take_attrs(PageAttrs::DIRTY), PageAttrs::all());
        assert_eq!(head.attrs(), PageAttrs::REFERENCED);
        head.reset();
        assert_eq!(head.attrs(), PageAttrs::empty());
    }

    #[test]
    fn reset_keeps_the_generation_moving() {
        let head = PvHead::new();
        head.begin();
        head.end();
        head.set_attrs(PageAttrs::DIRTY);
        let before = head.generation();
        head.reset();
        assert_eq!(head.generation(), before);
        head.begin();
        head.end();
        assert!(head.generation() > before);
    }
}
