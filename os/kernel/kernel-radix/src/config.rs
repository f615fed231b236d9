//! Runtime configuration of the MMU core.

use kernel_info::memory::{
    DEFAULT_KERNEL_PTP_PAGES, DEFAULT_PID_BITS, DEFAULT_PV_LOCK_BUCKETS, DEFAULT_TLB_FLUSH_CEILING,
    DEFAULT_VA_BITS,
};

use crate::error::MmuError;

/// Tunables fixed at bootstrap.
///
/// ```
/// # use kernel_radix::RadixConfig;
/// let config = RadixConfig::default().with_pid_bits(8).with_cpus(4);
/// assert_eq!(config.root_index_bits(), 13);
/// assert_eq!(config.process_table_bytes(), 256 * 16);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RadixConfig {
    /// Significant virtual address bits of every tree (40..=52).
    pub va_bits: u32,
    /// Width of the address-space identifier (1..=20).
    pub pid_bits: u32,
    /// Reverse-map bucket locks.
    pub pv_lock_buckets: usize,
    /// Single-page invalidations per batch before switching to one
    /// address-space-wide invalidation.
    pub tlb_single_page_flush_ceiling: usize,
    /// Level-3 kernel tables preallocated for the start of KVA.
    pub kernel_ptp_pages: usize,
    /// Upper bound on physical memory used, if any.
    pub physmem_limit: Option<u64>,
    /// Processors present (1..=64).
    pub cpus: u32,
}

impl Default for RadixConfig {
    fn default() -> Self {
        Self {
            va_bits: DEFAULT_VA_BITS,
            pid_bits: DEFAULT_PID_BITS,
            pv_lock_buckets: DEFAULT_PV_LOCK_BUCKETS,
            tlb_single_page_flush_ceiling: DEFAULT_TLB_FLUSH_CEILING,
            kernel_ptp_pages: DEFAULT_KERNEL_PTP_PAGES,
            physmem_limit: None,
            cpus: 1,
        }
    }
}

impl RadixConfig {
    #[must_use]
    pub const fn with_va_bits(mut self, va_bits: u32) -> Self {
        self.va_bits = va_bits;
        self
    }

    #[must_use]
    pub const fn with_pid_bits(mut self, pid_bits: u32) -> Self {
        self.pid_bits = pid_bits;
        self
    }

    #[must_use]
    pub const fn with_pv_lock_buckets(mut self, buckets: usize) -> Self {
        self.pv_lock_buckets = buckets;
        self
    }

    #[must_use]
    pub const fn with_tlb_flush_ceiling(mut self, ceiling: usize) -> Self {
        self.tlb_single_page_flush_ceiling = ceiling;
        self
    }

    #[must_use]
    pub const fn with_kernel_ptp_pages(mut self, pages: usize) -> Self {
        self.kernel_ptp_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_physmem_limit(mut self, limit: u64) -> Self {
        self.physmem_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Width of the root index.
    #[inline]
    #[must_use]
    pub const fn root_index_bits(&self) -> u32 {
        self.va_bits - 39
    }

    /// Radix tree size field: `va_bits - 31`.
    #[inline]
    #[must_use]
    pub const fn radix_tree_size(&self) -> u32 {
        self.va_bits - 31
    }

    /// log2 of the process table size in bytes; never below one page.
    #[inline]
    #[must_use]
    pub const fn process_table_shift(&self) -> u32 {
        if self.pid_bits + 4 < 12 {
            12
        } else {
            self.pid_bits + 4
        }
    }

    #[inline]
    #[must_use]
    pub const fn process_table_bytes(&self) -> u64 {
        1 << self.process_table_shift()
    }

    /// Mask with one bit per present processor.
    #[inline]
    #[must_use]
    pub const fn all_cpus(&self) -> u64 {
        if self.cpus >= 64 {
            u64::MAX
        } else {
            (1 << self.cpus) - 1
        }
    }

    /// Reject values the hardware or the data structures cannot express.
    ///
    /// # Errors
    /// [`MmuError::InvalidConfig`] naming the offending field.
    pub const fn validate(&self) -> Result<(), MmuError> {
        if self.va_bits <= 39 || self.va_bits > 52 {
            return Err(MmuError::InvalidConfig("va_bits must be in 40..=52"));
        }
        if self.pid_bits == 0 || self.pid_bits > 20 {
            return Err(MmuError::InvalidConfig("pid_bits must be in 1..=20"));
        }
        if self.pv_lock_buckets == 0 {
            return Err(MmuError::InvalidConfig("pv_lock_buckets must be non-zero"));
        }
        if self.cpus == 0 || self.cpus > 64 {
            return Err(MmuError::InvalidConfig("cpus must be in 1..=64"));
        }
        if self.kernel_ptp_pages > crate::RPTE_ENTRIES {
            return Err(MmuError::InvalidConfig(
                "kernel_ptp_pages must fit in one level-2 table",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_52_bit_tree() {
        let config = RadixConfig::default();
        assert_eq!(config.root_index_bits(), 13);
        assert_eq!(config.radix_tree_size(), 21);
        assert_eq!(config.process_table_bytes(), 64 * 1024);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn validate_names_the_bad_field() {
        assert!(matches!(
            RadixConfig::default().with_va_bits(39).validate(),
            Err(MmuError::InvalidConfig(msg)) if msg.starts_with("va_bits")
        ));
        assert!(RadixConfig::default().with_cpus(65).validate().is_err());
        assert_eq!(RadixConfig::default().with_cpus(64).all_cpus(), u64::MAX);
        assert_eq!(RadixConfig::default().with_cpus(3).all_cpus(), 0b111);
    }
}
