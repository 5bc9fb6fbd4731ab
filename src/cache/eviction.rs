//! FIFO-with-watermark eviction policy.
//!
//! The policy only answers "should this partition evict" and "which unit
//! goes next" (the oldest); the multi-subsystem reclaim protocol itself is
//! driven by the engine: unlink every incoming link, remove every fragment
//! from its table, unregister translations, synch all threads through a safe
//! point, then release the unit's pages.

/// Watermark configuration for one partition family.
#[derive(Clone, Copy, Debug)]
pub struct EvictPolicy {
    /// Fraction of the partition limit (in percent) above which eviction is
    /// triggered.
    pub high_watermark_pct: usize,
}

impl Default for EvictPolicy {
    fn default() -> Self {
        EvictPolicy {
            high_watermark_pct: 80,
        }
    }
}

impl EvictPolicy {
    /// Whether `used` bytes out of `limit` is above the high watermark.
    #[must_use]
    pub fn over_watermark(&self, used: usize, limit: usize) -> bool {
        if limit == usize::MAX {
            return false;
        }
        used.saturating_mul(100) > limit.saturating_mul(self.high_watermark_pct)
    }
}
