//! The per-thread fragment table.

use crate::{
    arch::AppPc,
    fragment::FragmentId,
    table::{bucket_of, InsertOutcome, LOAD_PCT},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Bucket {
    Empty,
    Tomb,
    Live(AppPc, FragmentId),
}

/// Open-addressed tag table owned by one thread context.
///
/// No synchronization: the owner is the only reader and writer. A
/// synchronizer may inspect it only while holding the owner suspended.
#[derive(Debug)]
pub struct PrivateTable {
    buckets: Vec<Bucket>,
    bits: u32,
    live: usize,
}

impl PrivateTable {
    /// An empty table with a small initial capacity.
    #[must_use]
    pub fn new() -> Self {
        PrivateTable::with_bits(6)
    }

    fn with_bits(bits: u32) -> Self {
        PrivateTable {
            buckets: vec![Bucket::Empty; 1 << bits],
            bits,
            live: 0,
        }
    }

    /// Looks up the fragment cached for `tag`.
    #[must_use]
    pub fn lookup(&self, tag: AppPc) -> Option<FragmentId> {
        let mask = self.buckets.len() - 1;
        let mut idx = bucket_of(tag.0, self.bits);
        loop {
            match self.buckets[idx & mask] {
                Bucket::Empty => return None,
                Bucket::Live(t, frag) if t == tag => return Some(frag),
                _ => idx += 1,
            }
        }
    }

    /// Inserts `(tag, frag)`, refusing duplicates.
    pub fn insert(&mut self, tag: AppPc, frag: FragmentId) -> InsertOutcome {
        if let Some(existing) = self.lookup(tag) {
            return InsertOutcome::AlreadyPresent(existing);
        }
        if (self.live + 1) * 100 > self.buckets.len() * LOAD_PCT {
            self.grow();
        }
        let mask = self.buckets.len() - 1;
        let mut idx = bucket_of(tag.0, self.bits);
        loop {
            match self.buckets[idx & mask] {
                Bucket::Empty | Bucket::Tomb => {
                    self.buckets[idx & mask] = Bucket::Live(tag, frag);
                    self.live += 1;
                    return InsertOutcome::Inserted;
                }
                Bucket::Live(..) => idx += 1,
            }
        }
    }

    /// Removes the entry for `tag`, returning the fragment it mapped to.
    pub fn remove(&mut self, tag: AppPc) -> Option<FragmentId> {
        let mask = self.buckets.len() - 1;
        let mut idx = bucket_of(tag.0, self.bits);
        loop {
            match self.buckets[idx & mask] {
                Bucket::Empty => return None,
                Bucket::Live(t, frag) if t == tag => {
                    self.buckets[idx & mask] = Bucket::Tomb;
                    self.live -= 1;
                    return Some(frag);
                }
                _ => idx += 1,
            }
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drains every entry, for thread teardown.
    pub fn drain(&mut self) -> Vec<(AppPc, FragmentId)> {
        let mut out = Vec::with_capacity(self.live);
        for bucket in &mut self.buckets {
            if let Bucket::Live(tag, frag) = *bucket {
                out.push((tag, frag));
                *bucket = Bucket::Empty;
            }
        }
        self.live = 0;
        out
    }

    fn grow(&mut self) {
        let mut grown = PrivateTable::with_bits(self.bits + 1);
        for bucket in &self.buckets {
            if let Bucket::Live(tag, frag) = *bucket {
                grown.insert(tag, frag);
            }
        }
        *self = grown;
    }
}

impl Default for PrivateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = PrivateTable::new();
        let frag = FragmentId::from_raw(3, 0);
        assert_eq!(table.insert(AppPc(0x100), frag), InsertOutcome::Inserted);
        assert_eq!(table.lookup(AppPc(0x100)), Some(frag));
        assert_eq!(table.remove(AppPc(0x100)), Some(frag));
        assert_eq!(table.lookup(AppPc(0x100)), None);
        assert_eq!(table.remove(AppPc(0x100)), None);
    }

    #[test]
    fn test_duplicate_insert_reports_existing() {
        let mut table = PrivateTable::new();
        let first = FragmentId::from_raw(1, 0);
        table.insert(AppPc(0x100), first);
        assert_eq!(
            table.insert(AppPc(0x100), FragmentId::from_raw(2, 0)),
            InsertOutcome::AlreadyPresent(first)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = PrivateTable::new();
        for i in 0..500u64 {
            table.insert(AppPc(0x1000 + i * 8), FragmentId::from_raw(i as u32, 0));
        }
        assert_eq!(table.len(), 500);
        for i in 0..500u64 {
            assert_eq!(
                table.lookup(AppPc(0x1000 + i * 8)),
                Some(FragmentId::from_raw(i as u32, 0))
            );
        }
    }

    #[test]
    fn test_tombstone_probe_chain() {
        let mut table = PrivateTable::new();
        // Fill a cluster, punch a hole, and confirm probing skips it.
        for i in 0..8u64 {
            table.insert(AppPc(i), FragmentId::from_raw(i as u32, 0));
        }
        table.remove(AppPc(3));
        for i in (0..8u64).filter(|&i| i != 3) {
            assert!(table.lookup(AppPc(i)).is_some(), "entry {i} survived");
        }
    }
}
