//! The software code cache: engine-owned memory holding fragment bodies.
//!
//! Cache memory is carved into [`Unit`]s, contiguous regions reserved through
//! the OS facade and bump-filled with fragment bodies. Units belong to a
//! [`Partition`]: per-thread private blocks, process-shared blocks, traces,
//! or read-only frozen modules. When a partition's live bytes cross its high
//! watermark, the FIFO eviction policy selects the oldest unit for reclaim;
//! the reclaim protocol itself (unlink, table removal, synchall grace, then
//! release) is driven by the engine because it spans several subsystems.
//!
//! # Invariants
//!
//! - A fragment is reachable from a fragment table iff its bytes are live in
//!   a cache unit.
//! - Cache memory is never read or written by application code; only engine
//!   code reaches it outside of execution.
//! - A unit is released only after every fragment in it has been unlinked and
//!   unregistered and all threads have passed a safe point.
//!
//! # Locking
//!
//! The unit list itself is append-only ([`boxcar::Vec`]), so readers navigate
//! it without locks; the exclusive allocation lock is held only while placing
//! bytes or opening/retiring units, per the crate-wide lock rank.

mod eviction;
mod unit;

pub use eviction::EvictPolicy;
pub use unit::{Unit, UnitId};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crossbeam_skiplist::SkipMap;
use rustc_hash::FxHashMap;

use crate::{
    arch::CachePc,
    fragment::FragmentId,
    heap::ExecBudget,
    os::{OsFacade, OsRegion, Protection, ThreadId},
    Error, Result,
};

/// Which part of the cache a unit (and the fragments in it) belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, strum::Display)]
pub enum Partition {
    /// Per-thread private basic blocks.
    #[strum(serialize = "private")]
    Private,
    /// Process-shared basic blocks.
    #[strum(serialize = "shared")]
    Shared,
    /// Trace fragments.
    #[strum(serialize = "trace")]
    Trace,
    /// Read-only fragments mapped from a persisted module cache.
    #[strum(serialize = "frozen")]
    Frozen,
}

impl Partition {
    pub(crate) fn index(self) -> usize {
        match self {
            Partition::Private => 0,
            Partition::Shared => 1,
            Partition::Trace => 2,
            Partition::Frozen => 3,
        }
    }
}

/// Where a fragment body landed in the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CacheSlot {
    /// Owning unit.
    pub unit: UnitId,
    /// Entry address of the body.
    pub pc: CachePc,
    /// Byte offset of the body within the unit.
    pub offset: u32,
    /// Body length in bytes.
    pub len: u32,
}

/// Per-partition byte limits used to size the [`ExecBudget`]s.
#[derive(Clone, Copy, Debug)]
pub struct CacheLimits {
    /// Unit size for every partition.
    pub unit_size: usize,
    /// Private-partition byte limit (all threads together).
    pub private_limit: usize,
    /// Shared-partition byte limit.
    pub shared_limit: usize,
    /// Trace-partition byte limit.
    pub trace_limit: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            unit_size: 64 * 1024,
            private_limit: 4 * 1024 * 1024,
            shared_limit: 16 * 1024 * 1024,
            trace_limit: 8 * 1024 * 1024,
        }
    }
}

type PartKey = (Partition, Option<ThreadId>);

#[derive(Default)]
struct AllocState {
    /// Currently open (bump-filled) unit per partition key.
    open: FxHashMap<PartKey, u32>,
}

/// The process-wide code cache.
///
/// See the [module docs](self) for the ownership and locking story.
pub struct CodeCache {
    units: boxcar::Vec<Unit>,
    by_base: SkipMap<u64, u32>,
    alloc: Mutex<AllocState>,
    budgets: [ExecBudget; 4],
    policy: EvictPolicy,
    unit_size: usize,
    seq: AtomicU64,
    os: Arc<dyn OsFacade>,
}

impl CodeCache {
    /// Creates a cache that reserves units through `os` within `limits`.
    #[must_use]
    pub fn new(os: Arc<dyn OsFacade>, limits: CacheLimits) -> Self {
        CodeCache {
            units: boxcar::Vec::new(),
            by_base: SkipMap::new(),
            alloc: Mutex::new(AllocState::default()),
            budgets: [
                ExecBudget::new(limits.private_limit),
                ExecBudget::new(limits.shared_limit),
                ExecBudget::new(limits.trace_limit),
                ExecBudget::new(usize::MAX),
            ],
            policy: EvictPolicy::default(),
            unit_size: limits.unit_size,
            seq: AtomicU64::new(0),
            os,
        }
    }

    /// Places `bytes` into the given partition, opening a new unit when the
    /// current one is full.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCache`] when the partition budget is exhausted; the
    /// caller runs one round of eviction and retries before giving up.
    pub fn place(
        &self,
        partition: Partition,
        owner: Option<ThreadId>,
        bytes: &[u8],
    ) -> Result<CacheSlot> {
        if bytes.len() > self.unit_size {
            return Err(corrupt_error!(
                "fragment body of {} bytes exceeds unit size {}",
                bytes.len(),
                self.unit_size
            ));
        }
        let key = (partition, owner);
        let mut state = lock!(self.alloc);

        if let Some(&idx) = state.open.get(&key) {
            if let Some(slot) = self.units[idx as usize].try_append(bytes) {
                return Ok(slot);
            }
        }

        let idx = self.open_unit(partition, owner)?;
        state.open.insert(key, idx);
        self.units[idx as usize]
            .try_append(bytes)
            .ok_or(Error::OutOfCache)
    }

    /// Registers `frag` as the owner of the body at `slot`.
    pub fn register_fragment(&self, slot: CacheSlot, frag: FragmentId) {
        self.units[slot.unit.0 as usize].register_fragment(slot.offset, slot.len, frag);
    }

    /// Drops the registration of `frag` in its unit, making its bytes dead.
    pub fn unregister_fragment(&self, slot: CacheSlot, frag: FragmentId) {
        self.units[slot.unit.0 as usize].unregister_fragment(frag);
    }

    /// Copies cache bytes starting at `pc` into `buf`, stopping at the fill
    /// point of the containing unit.
    ///
    /// # Errors
    ///
    /// [`Error::NotInCache`] when `pc` lies in no live unit.
    pub fn read(&self, pc: CachePc, buf: &mut [u8]) -> Result<usize> {
        let unit = self.unit_containing(pc).ok_or(Error::NotInCache(pc))?;
        Ok(unit.read((pc.0 - unit.base()) as u32, buf))
    }

    /// The fragment whose body covers `pc`, if any.
    #[must_use]
    pub fn fragment_at(&self, pc: CachePc) -> Option<FragmentId> {
        let unit = self.unit_containing(pc)?;
        unit.fragment_at((pc.0 - unit.base()) as u32)
    }

    /// The unit containing `pc`, if any.
    #[must_use]
    pub fn unit_containing(&self, pc: CachePc) -> Option<&Unit> {
        let entry = self.by_base.range(..=pc.0).next_back()?;
        let unit = &self.units[*entry.value() as usize];
        unit.contains(pc).then_some(unit)
    }

    /// The unit with the given id, if still tracked.
    #[must_use]
    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(id.0 as usize)
    }

    /// Whether the partition's live bytes have crossed the eviction
    /// watermark.
    #[must_use]
    pub fn needs_eviction(&self, partition: Partition) -> bool {
        self.policy
            .over_watermark(self.budgets[partition.index()].used(), self.budgets[partition.index()].limit())
    }

    /// Selects the oldest reclaimable unit of the partition (restricted to
    /// `owner`'s units for the private partition), marking it retired so no
    /// further fragments are placed into it.
    ///
    /// Returns `None` when the partition has no reclaim candidate.
    #[must_use]
    pub fn retire_oldest(&self, partition: Partition, owner: Option<ThreadId>) -> Option<UnitId> {
        let mut state = lock!(self.alloc);
        let mut candidate: Option<&Unit> = None;
        for (_, unit) in self.units.iter() {
            if unit.partition() != partition || unit.is_retired() || unit.is_released() {
                continue;
            }
            if partition == Partition::Private && unit.owner() != owner {
                continue;
            }
            if candidate.map_or(true, |best| unit.seq() < best.seq()) {
                candidate = Some(unit);
            }
        }
        let unit = candidate?;
        unit.retire();
        state.open.retain(|_, idx| *idx != unit.id().0);
        tracing::debug!(unit = unit.id().0, %partition, "retiring cache unit for reclaim");
        Some(unit.id())
    }

    /// Fragments currently registered in `unit`, oldest placement first.
    #[must_use]
    pub fn fragments_in(&self, unit: UnitId) -> Vec<FragmentId> {
        self.units[unit.0 as usize].fragments()
    }

    /// Releases a retired unit's memory back to the facade.
    ///
    /// The caller must have unlinked and unregistered every fragment and
    /// synched all threads out of the unit first.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`] when live fragments remain registered.
    pub fn release_unit(&self, id: UnitId) -> Result<()> {
        let unit = &self.units[id.0 as usize];
        if !unit.fragments().is_empty() {
            return Err(corrupt_error!(
                "releasing unit {} with {} live fragments",
                id.0,
                unit.fragments().len()
            ));
        }
        self.by_base.remove(&unit.base());
        let bytes = unit.release();
        self.budgets[unit.partition().index()].refund(bytes);
        self.os.free(OsRegion {
            base: unit.base(),
            size: unit.capacity() as u64,
        })?;
        tracing::debug!(unit = id.0, "released cache unit");
        Ok(())
    }

    /// Bytes currently charged against the partition budget.
    #[must_use]
    pub fn used_bytes(&self, partition: Partition) -> usize {
        self.budgets[partition.index()].used()
    }

    /// Retires and releases every unit with no live fragments left, any
    /// partition and owner. Process-teardown path: the caller has already
    /// emptied the fragment tables and synched all threads.
    ///
    /// # Errors
    ///
    /// Propagates release failures.
    pub fn release_all(&self) -> Result<()> {
        {
            let mut state = lock!(self.alloc);
            state.open.clear();
        }
        for (_, unit) in self.units.iter() {
            if unit.is_released() {
                continue;
            }
            unit.retire();
            if unit.fragments().is_empty() {
                self.release_unit(unit.id())?;
            }
        }
        Ok(())
    }

    /// Adds a read-only frozen unit whose bytes come from a mapped module
    /// cache rather than the bump allocator.
    ///
    /// # Errors
    ///
    /// Propagates reservation failure from the facade.
    pub fn adopt_frozen(&self, bytes: Vec<u8>) -> Result<UnitId> {
        let _state = lock!(self.alloc);
        self.budgets[Partition::Frozen.index()].charge(bytes.len())?;
        let region = self.os.reserve(bytes.len().max(1), None)?;
        let idx = self.units.count() as u32;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let unit = Unit::frozen(UnitId(idx), region.base, bytes, seq);
        let real = self.units.push(unit) as u32;
        debug_assert_eq!(real, idx);
        self.by_base.insert(region.base, idx);
        Ok(UnitId(idx))
    }

    fn open_unit(&self, partition: Partition, owner: Option<ThreadId>) -> Result<u32> {
        self.budgets[partition.index()].charge(self.unit_size)?;
        let region = match self.os.reserve(self.unit_size, None) {
            Ok(region) => region,
            Err(e) => {
                self.budgets[partition.index()].refund(self.unit_size);
                return Err(e);
            }
        };
        self.os.commit(&region, Protection::RWX)?;
        let idx = self.units.count() as u32;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let unit = Unit::new(UnitId(idx), partition, owner, region.base, self.unit_size, seq);
        let real = self.units.push(unit) as u32;
        debug_assert_eq!(real, idx);
        self.by_base.insert(region.base, idx);
        tracing::debug!(unit = idx, %partition, base = region.base, "opened cache unit");
        Ok(idx)
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("units", &self.units.count())
            .field("shared_used", &self.used_bytes(Partition::Shared))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toy::ToyOs;

    fn small_cache() -> CodeCache {
        let limits = CacheLimits {
            unit_size: 128,
            private_limit: 256,
            shared_limit: 256,
            trace_limit: 256,
        };
        CodeCache::new(Arc::new(ToyOs::new()), limits)
    }

    #[test]
    fn test_place_and_read_back() {
        let cache = small_cache();
        let slot = cache.place(Partition::Shared, None, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        let n = cache.read(slot.pc, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_fragment_registration_lookup() {
        let cache = small_cache();
        let slot = cache.place(Partition::Shared, None, &[0; 16]).unwrap();
        let frag = FragmentId::from_raw(7, 0);
        cache.register_fragment(slot, frag);
        assert_eq!(cache.fragment_at(slot.pc), Some(frag));
        assert_eq!(cache.fragment_at(slot.pc.advance(15)), Some(frag));
        cache.unregister_fragment(slot, frag);
        assert_eq!(cache.fragment_at(slot.pc), None);
    }

    #[test]
    fn test_budget_exhaustion_reports_out_of_cache() {
        let cache = small_cache();
        // 256-byte budget, 128-byte units: two units fit, the third does not.
        cache.place(Partition::Trace, None, &[0; 100]).unwrap();
        cache.place(Partition::Trace, None, &[0; 100]).unwrap();
        let err = cache.place(Partition::Trace, None, &[0; 100]).unwrap_err();
        assert!(matches!(err, Error::OutOfCache));
    }

    #[test]
    fn test_retire_picks_oldest_unit() {
        let cache = small_cache();
        let a = cache.place(Partition::Shared, None, &[0; 100]).unwrap();
        let _b = cache.place(Partition::Shared, None, &[0; 100]).unwrap();
        let retired = cache.retire_oldest(Partition::Shared, None).unwrap();
        assert_eq!(retired, a.unit);
        // A retired unit no longer accepts placements; a fresh unit would be
        // needed, and the budget is exhausted.
        assert!(cache.place(Partition::Shared, None, &[0; 100]).is_err());
    }

    #[test]
    fn test_release_refunds_budget() {
        let cache = small_cache();
        let slot = cache.place(Partition::Shared, None, &[0; 64]).unwrap();
        let frag = FragmentId::from_raw(1, 0);
        cache.register_fragment(slot, frag);
        let unit = cache.retire_oldest(Partition::Shared, None).unwrap();

        assert!(cache.release_unit(unit).is_err(), "live fragment blocks release");
        cache.unregister_fragment(slot, frag);
        cache.release_unit(unit).unwrap();
        assert_eq!(cache.used_bytes(Partition::Shared), 0);
        assert!(cache.read(slot.pc, &mut [0u8; 4]).is_err());
    }
}
