//! The indirect-branch lookup table.
//!
//! A hand-sized, lossy, open-addressed map from application target to cache
//! entry, probed from inside the cache on every indirect branch, call, and
//! return. Its contract is asymmetric: a **false miss is allowed** (the
//! probe exits to dispatch, which resolves the target the slow way and
//! refills the table), a **false hit is never allowed** (a wrong jump target
//! would execute the wrong code). Misses cost a dispatch round-trip; that is
//! the degradation mode under capacity pressure, collision eviction, and
//! flush.
//!
//! Slot occupancy lives in a dedicated bit of the *entry* word, never in a
//! reserved tag or entry value, so every representable application tag and
//! every representable cache address round-trips. (Cache addresses fit in
//! 63 bits; the exit-slot encoding in [`crate::fragment`] leans on the same
//! invariant.) Writers invalidate a slot before republishing it, and the
//! probe re-validates the tag after reading the entry, so a torn observation
//! of a concurrent overwrite degrades to a miss.
//!
//! Entries are only ever inserted by dispatch after a successful resolution
//! and removed during flush while every other thread is held at a safe
//! point, so an occupied (tag, entry) pair is always internally consistent.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{AppPc, CachePc};

/// Occupancy bit of an entry word; the remaining bits are the cache address.
const OCCUPIED: u64 = 1 << 63;
/// Linear-probe window before a lossy overwrite.
const PROBE_WINDOW: usize = 4;

/// The lossy indirect-branch target table.
///
/// Capacity is a power of two, fixed at construction. One instance may be
/// process-shared or per-thread; the engine default is one shared table.
pub struct IblTable {
    tags: Vec<AtomicU64>,
    entries: Vec<AtomicU64>,
    bits: u32,
}

impl IblTable {
    /// A table with `1 << bits` slots.
    #[must_use]
    pub fn new(bits: u32) -> Self {
        let len = 1usize << bits;
        IblTable {
            tags: (0..len).map(|_| AtomicU64::new(0)).collect(),
            entries: (0..len).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    /// Probes for `target`. Returns the cache entry on a hit, `None` on a
    /// (possibly false) miss. Never returns a false hit.
    #[must_use]
    pub fn probe(&self, target: AppPc) -> Option<CachePc> {
        let mask = self.tags.len() - 1;
        let mut idx = self.bucket(target.0);
        for _ in 0..PROBE_WINDOW {
            let slot = idx & mask;
            if self.entries[slot].load(Ordering::Acquire) & OCCUPIED == 0 {
                // Vacant slot ends the probe chain; lossy means a stale
                // chain break is just a miss.
                return None;
            }
            if self.tags[slot].load(Ordering::Acquire) == target.0 {
                let entry = self.entries[slot].load(Ordering::Acquire);
                // Re-validate both halves: a concurrent overwrite of this
                // slot must read as a miss, never as a hit on the wrong
                // entry.
                if entry & OCCUPIED != 0
                    && self.tags[slot].load(Ordering::Acquire) == target.0
                {
                    return Some(CachePc(entry & !OCCUPIED));
                }
                return None;
            }
            idx += 1;
        }
        None
    }

    /// Publishes `(target, entry)`, overwriting the probe window's last slot
    /// when every candidate is taken (lossy).
    pub fn insert(&self, target: AppPc, entry: CachePc) {
        debug_assert_eq!(entry.0 & OCCUPIED, 0, "cache addresses fit in 63 bits");
        let mask = self.tags.len() - 1;
        let mut idx = self.bucket(target.0);
        let mut victim = idx & mask;
        for _ in 0..PROBE_WINDOW {
            let slot = idx & mask;
            let occupied = self.entries[slot].load(Ordering::Acquire) & OCCUPIED != 0;
            if !occupied || self.tags[slot].load(Ordering::Acquire) == target.0 {
                victim = slot;
                break;
            }
            victim = slot;
            idx += 1;
        }
        // Invalidate first so a racing probe misses instead of pairing the
        // old tag with the new entry.
        self.entries[victim].store(0, Ordering::Release);
        self.tags[victim].store(target.0, Ordering::Release);
        self.entries[victim].store(OCCUPIED | entry.0, Ordering::Release);
    }

    /// Removes the entry for `target` if present (flush path; callers hold
    /// the rest of the flush protocol).
    pub fn remove(&self, target: AppPc) {
        let mask = self.tags.len() - 1;
        let mut idx = self.bucket(target.0);
        for _ in 0..PROBE_WINDOW {
            let slot = idx & mask;
            if self.entries[slot].load(Ordering::Acquire) & OCCUPIED != 0
                && self.tags[slot].load(Ordering::Acquire) == target.0
            {
                self.entries[slot].store(0, Ordering::Release);
                return;
            }
            idx += 1;
        }
    }

    /// Clears every slot (unit reclaim, detach).
    pub fn clear(&self) {
        for slot in 0..self.tags.len() {
            self.entries[slot].store(0, Ordering::Release);
            self.tags[slot].store(0, Ordering::Release);
        }
    }

    fn bucket(&self, tag: u64) -> usize {
        let h = tag.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h >> (64 - self.bits)) as usize
    }
}

impl std::fmt::Debug for IblTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IblTable")
            .field("slots", &self.tags.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_miss_then_hit() {
        let table = IblTable::new(4);
        assert_eq!(table.probe(AppPc(0x100)), None);
        table.insert(AppPc(0x100), CachePc(0x9000));
        assert_eq!(table.probe(AppPc(0x100)), Some(CachePc(0x9000)));
    }

    #[test]
    fn test_remove_restores_miss() {
        let table = IblTable::new(4);
        table.insert(AppPc(0x100), CachePc(0x9000));
        table.remove(AppPc(0x100));
        assert_eq!(table.probe(AppPc(0x100)), None);
    }

    #[test]
    fn test_capacity_pressure_degrades_to_miss_never_wrong_hit() {
        // Two slots: guaranteed collisions.
        let table = IblTable::new(1);
        let targets: Vec<u64> = (0..32).map(|i| 0x1000 + i * 0x40).collect();
        for &t in &targets {
            table.insert(AppPc(t), CachePc(t + 0x10_0000));
        }
        for &t in &targets {
            match table.probe(AppPc(t)) {
                None => {} // lossy: a miss is fine
                Some(entry) => assert_eq!(entry, CachePc(t + 0x10_0000), "false hit"),
            }
        }
    }

    #[test]
    fn test_reinsert_updates_entry() {
        let table = IblTable::new(4);
        table.insert(AppPc(0x100), CachePc(0x9000));
        table.insert(AppPc(0x100), CachePc(0xa000));
        assert_eq!(table.probe(AppPc(0x100)), Some(CachePc(0xa000)));
    }

    #[test]
    fn test_extreme_tags_and_zero_entry_round_trip() {
        // No tag value is reserved, and a zero cache address is a real hit,
        // not an accidental tombstone.
        let table = IblTable::new(4);
        table.insert(AppPc(u64::MAX), CachePc(0));
        table.insert(AppPc(0), CachePc(0x7000_0000_0000));
        assert_eq!(table.probe(AppPc(u64::MAX)), Some(CachePc(0)));
        assert_eq!(table.probe(AppPc(0)), Some(CachePc(0x7000_0000_0000)));
        table.remove(AppPc(u64::MAX));
        assert_eq!(table.probe(AppPc(u64::MAX)), None);
    }
}
