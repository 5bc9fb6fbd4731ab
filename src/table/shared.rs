//! The process-shared fragment table under a sequence lock.

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, RwLock,
};

use crate::{
    arch::AppPc,
    fragment::FragmentId,
    table::{bucket_of, InsertOutcome, LOAD_PCT},
};

/// Bucket state: never occupied.
const EMPTY: u8 = 0;
/// Bucket state: previously occupied; probing continues past it.
const TOMB: u8 = 1;
/// Bucket state: holds a live (tag, fragment) pair.
const LIVE: u8 = 2;

fn pack(id: FragmentId) -> u64 {
    (u64::from(id.index()) << 32) | u64::from(id.generation())
}

fn unpack(word: u64) -> FragmentId {
    FragmentId::from_raw((word >> 32) as u32, word as u32)
}

/// One bucket array. Occupancy lives in a dedicated state byte per bucket,
/// so the tag words carry the full `u64` application-address space with no
/// reserved values; the sequence lock makes the multi-word reads safe.
struct Buckets {
    bits: u32,
    state: Vec<AtomicU8>,
    tags: Vec<AtomicU64>,
    frag: Vec<AtomicU64>,
}

impl Buckets {
    fn new(bits: u32) -> Self {
        let len = 1usize << bits;
        Buckets {
            bits,
            state: (0..len).map(|_| AtomicU8::new(EMPTY)).collect(),
            tags: (0..len).map(|_| AtomicU64::new(0)).collect(),
            frag: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn len(&self) -> usize {
        self.state.len()
    }

    /// Probes for `tag`; returns the bucket index holding it, or the first
    /// insertable index.
    fn probe(&self, tag: u64) -> ProbeResult {
        let mask = self.len() - 1;
        let mut idx = bucket_of(tag, self.bits);
        let mut first_free = None;
        for _ in 0..self.len() {
            let slot = idx & mask;
            match self.state[slot].load(Ordering::Acquire) {
                EMPTY => {
                    return ProbeResult {
                        hit: None,
                        free: Some(first_free.unwrap_or(slot)),
                    }
                }
                TOMB => {
                    first_free.get_or_insert(slot);
                    idx += 1;
                }
                _ => {
                    if self.tags[slot].load(Ordering::Acquire) == tag {
                        return ProbeResult {
                            hit: Some(slot),
                            free: None,
                        };
                    }
                    idx += 1;
                }
            }
        }
        ProbeResult {
            hit: None,
            free: first_free,
        }
    }
}

struct ProbeResult {
    hit: Option<usize>,
    free: Option<usize>,
}

struct WriterState {
    live: usize,
}

/// The process-shared tag table.
///
/// Reads are lock-free apart from a brief read-lock to clone the bucket-array
/// handle: a reader samples the sequence number, probes, and re-samples; any
/// concurrent mutation moves the sequence and sends the reader around again.
/// Writers (insert, remove, resize) serialize on one mutex and hold the
/// sequence odd for the duration of the mutation. Resize swaps in a doubled
/// array; readers still probing the old array fail sequence validation and
/// retry against the new one, and the old array is freed when the last such
/// reader drops its handle — the resize grace period, made explicit.
pub struct SharedTable {
    seq: AtomicU64,
    buckets: RwLock<Arc<Buckets>>,
    writer: Mutex<WriterState>,
}

impl SharedTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        SharedTable {
            seq: AtomicU64::new(0),
            buckets: RwLock::new(Arc::new(Buckets::new(8))),
            writer: Mutex::new(WriterState { live: 0 }),
        }
    }

    /// Looks up the fragment cached for `tag`, retrying across concurrent
    /// mutations until a consistent read lands.
    #[must_use]
    pub fn lookup(&self, tag: AppPc) -> Option<FragmentId> {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let buckets = read_lock!(self.buckets).clone();
            let result = buckets
                .probe(tag.0)
                .hit
                .map(|slot| unpack(buckets.frag[slot].load(Ordering::Acquire)));
            if self.seq.load(Ordering::Acquire) == s1 {
                return result;
            }
        }
    }

    /// Inserts `(tag, frag)`, refusing duplicates.
    pub fn insert(&self, tag: AppPc, frag: FragmentId) -> InsertOutcome {
        let mut writer = lock!(self.writer);
        let buckets = read_lock!(self.buckets).clone();
        if let Some(slot) = buckets.probe(tag.0).hit {
            return InsertOutcome::AlreadyPresent(unpack(
                buckets.frag[slot].load(Ordering::Acquire),
            ));
        }

        let buckets = if (writer.live + 1) * 100 > buckets.len() * LOAD_PCT {
            self.resize(&buckets)
        } else {
            buckets
        };

        let slot = buckets
            .probe(tag.0)
            .free
            .expect("resized table always has a free bucket");
        self.seq.fetch_add(1, Ordering::AcqRel);
        buckets.frag[slot].store(pack(frag), Ordering::Release);
        buckets.tags[slot].store(tag.0, Ordering::Release);
        buckets.state[slot].store(LIVE, Ordering::Release);
        self.seq.fetch_add(1, Ordering::AcqRel);
        writer.live += 1;
        InsertOutcome::Inserted
    }

    /// Removes the entry for `tag`, returning the fragment it mapped to.
    pub fn remove(&self, tag: AppPc) -> Option<FragmentId> {
        let mut writer = lock!(self.writer);
        let buckets = read_lock!(self.buckets).clone();
        let slot = buckets.probe(tag.0).hit?;
        let removed = unpack(buckets.frag[slot].load(Ordering::Acquire));
        self.seq.fetch_add(1, Ordering::AcqRel);
        buckets.state[slot].store(TOMB, Ordering::Release);
        self.seq.fetch_add(1, Ordering::AcqRel);
        writer.live -= 1;
        Some(removed)
    }

    /// Removes the entry for `tag` only when it still maps to `expect`.
    ///
    /// The flush protocol uses this so a racing re-registration (e.g. a
    /// trace shadowing the block being flushed) is never knocked out.
    pub fn remove_match(&self, tag: AppPc, expect: FragmentId) -> bool {
        let mut writer = lock!(self.writer);
        let buckets = read_lock!(self.buckets).clone();
        let Some(slot) = buckets.probe(tag.0).hit else {
            return false;
        };
        if unpack(buckets.frag[slot].load(Ordering::Acquire)) != expect {
            return false;
        }
        self.seq.fetch_add(1, Ordering::AcqRel);
        buckets.state[slot].store(TOMB, Ordering::Release);
        self.seq.fetch_add(1, Ordering::AcqRel);
        writer.live -= 1;
        true
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock!(self.writer).live
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live entry under the writer lock.
    pub fn for_each(&self, mut f: impl FnMut(AppPc, FragmentId)) {
        let _writer = lock!(self.writer);
        let buckets = read_lock!(self.buckets).clone();
        for slot in 0..buckets.len() {
            if buckets.state[slot].load(Ordering::Acquire) == LIVE {
                f(
                    AppPc(buckets.tags[slot].load(Ordering::Acquire)),
                    unpack(buckets.frag[slot].load(Ordering::Acquire)),
                );
            }
        }
    }

    /// Doubles the bucket array, dropping tombstones. Caller holds the
    /// writer lock.
    fn resize(&self, old: &Arc<Buckets>) -> Arc<Buckets> {
        let grown = Arc::new(Buckets::new(old.bits + 1));
        for slot in 0..old.len() {
            if old.state[slot].load(Ordering::Acquire) != LIVE {
                continue;
            }
            let tag = old.tags[slot].load(Ordering::Acquire);
            let free = grown
                .probe(tag)
                .free
                .expect("doubled table has room for every entry");
            grown.frag[free].store(old.frag[slot].load(Ordering::Acquire), Ordering::Release);
            grown.tags[free].store(tag, Ordering::Release);
            grown.state[free].store(LIVE, Ordering::Release);
        }
        self.seq.fetch_add(1, Ordering::AcqRel);
        *write_lock!(self.buckets) = grown.clone();
        self.seq.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(buckets = grown.len(), "shared fragment table resized");
        grown
    }
}

impl Default for SharedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTable").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_lookup_remove() {
        let table = SharedTable::new();
        let frag = FragmentId::from_raw(9, 2);
        assert_eq!(table.insert(AppPc(0x100), frag), InsertOutcome::Inserted);
        assert_eq!(table.lookup(AppPc(0x100)), Some(frag));
        assert_eq!(table.remove(AppPc(0x100)), Some(frag));
        assert_eq!(table.lookup(AppPc(0x100)), None);
    }

    #[test]
    fn test_duplicate_insert_loses_race() {
        let table = SharedTable::new();
        let first = FragmentId::from_raw(1, 0);
        table.insert(AppPc(0x100), first);
        assert_eq!(
            table.insert(AppPc(0x100), FragmentId::from_raw(2, 0)),
            InsertOutcome::AlreadyPresent(first)
        );
    }

    #[test]
    fn test_no_tag_value_is_reserved() {
        // The whole u64 address space is a valid key: occupancy lives in
        // the state byte, never in the tag word.
        let table = SharedTable::new();
        for (i, tag) in [0u64, u64::MAX, u64::MAX - 1].into_iter().enumerate() {
            table.insert(AppPc(tag), FragmentId::from_raw(i as u32, 0));
        }
        for (i, tag) in [0u64, u64::MAX, u64::MAX - 1].into_iter().enumerate() {
            assert_eq!(
                table.lookup(AppPc(tag)),
                Some(FragmentId::from_raw(i as u32, 0)),
                "tag {tag:#x} must be representable"
            );
        }
        assert_eq!(
            table.remove(AppPc(u64::MAX)),
            Some(FragmentId::from_raw(1, 0))
        );
        assert_eq!(table.lookup(AppPc(u64::MAX)), None);
        assert_eq!(table.lookup(AppPc(u64::MAX - 1)), Some(FragmentId::from_raw(2, 0)));
    }

    #[test]
    fn test_resize_keeps_all_entries() {
        let table = SharedTable::new();
        for i in 0..2000u64 {
            table.insert(AppPc(0x10_0000 + i * 4), FragmentId::from_raw(i as u32, 0));
        }
        for i in 0..2000u64 {
            assert_eq!(
                table.lookup(AppPc(0x10_0000 + i * 4)),
                Some(FragmentId::from_raw(i as u32, 0))
            );
        }
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let table = Arc::new(SharedTable::new());
        for i in 0..64u64 {
            table.insert(AppPc(i * 8), FragmentId::from_raw(i as u32, 0));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for round in 0..200u64 {
                    let i = round % 64;
                    if let Some(frag) = table.lookup(AppPc(i * 8)) {
                        assert_eq!(frag.index(), i as u32, "wrong fragment for tag");
                    }
                }
            }));
        }
        // Concurrent writer churns inserts and removes, forcing resizes.
        for i in 64..1500u64 {
            table.insert(AppPc(i * 8), FragmentId::from_raw(i as u32, 0));
            if i % 3 == 0 {
                table.remove(AppPc((i - 32) * 8));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
