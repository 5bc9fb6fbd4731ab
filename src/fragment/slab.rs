//! Dense-id fragment arena with generation checks.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::fragment::Fragment;

/// Identifier of a fragment: a dense slab index plus a generation.
///
/// Ids are what cross thread boundaries; the generation makes an id from a
/// previous occupant of the slot resolve to `None` instead of the wrong
/// fragment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId {
    index: u32,
    generation: u32,
}

impl FragmentId {
    /// Constructs an id from raw parts (test and persistence use).
    #[must_use]
    pub fn from_raw(index: u32, generation: u32) -> Self {
        FragmentId { index, generation }
    }

    /// Slab index.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the id was minted with.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}g{}", self.index, self.generation)
    }
}

impl fmt::Debug for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentId({self})")
    }
}

struct Slot {
    generation: u32,
    frag: Option<Arc<Fragment>>,
}

/// The process-wide fragment arena.
///
/// Slots are append-only ([`boxcar::Vec`]) so readers resolve ids without a
/// global lock; each slot's occupant sits behind its own `RwLock`. Removal
/// bumps the slot generation and pushes the index onto a free list for
/// reuse. The returned `Arc<Fragment>` is the pin: a reader that resolved an
/// id keeps the record alive even while eviction retires it, and the bytes
/// it points at stay mapped until the unit-reclaim grace period ends.
pub struct FragmentSlab {
    slots: boxcar::Vec<RwLock<Slot>>,
    free: Mutex<Vec<u32>>,
}

impl FragmentSlab {
    /// An empty slab.
    #[must_use]
    pub fn new() -> Self {
        FragmentSlab {
            slots: boxcar::Vec::new(),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a fragment, returning its id.
    pub fn insert(&self, frag: Fragment) -> FragmentId {
        let frag = Arc::new(frag);
        if let Some(index) = lock!(self.free).pop() {
            let mut slot = write_lock!(self.slots[index as usize]);
            debug_assert!(slot.frag.is_none());
            slot.frag = Some(frag);
            return FragmentId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.push(RwLock::new(Slot {
            generation: 0,
            frag: Some(frag),
        })) as u32;
        FragmentId {
            index,
            generation: 0,
        }
    }

    /// Resolves an id, pinning the fragment with the returned `Arc`.
    ///
    /// Stale ids (slot reused, generation bumped) resolve to `None`.
    #[must_use]
    pub fn get(&self, id: FragmentId) -> Option<Arc<Fragment>> {
        let slot = read_lock!(self.slots.get(id.index as usize)?);
        (slot.generation == id.generation)
            .then(|| slot.frag.clone())
            .flatten()
    }

    /// Removes a fragment, invalidating its id.
    ///
    /// Returns the record so the caller can finish tearing down links and
    /// cache registration; the record is freed when the last pin drops.
    pub fn remove(&self, id: FragmentId) -> Option<Arc<Fragment>> {
        let taken = {
            let mut slot = write_lock!(self.slots.get(id.index as usize)?);
            if slot.generation != id.generation {
                return None;
            }
            let taken = slot.frag.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            taken
        };
        lock!(self.free).push(id.index);
        Some(taken)
    }

    /// Number of live fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|(_, s)| read_lock!(s).frag.is_some())
            .count()
    }

    /// Whether the slab holds no live fragments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live fragment.
    pub fn for_each(&self, mut f: impl FnMut(FragmentId, &Arc<Fragment>)) {
        for (index, slot) in self.slots.iter() {
            let slot = read_lock!(slot);
            if let Some(frag) = &slot.frag {
                f(
                    FragmentId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    frag,
                );
            }
        }
    }
}

impl Default for FragmentSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::AppPc,
        cache::{CacheSlot, Partition, UnitId},
        arch::CachePc,
        fragment::FragmentFlags,
        translate::TranslationTable,
    };

    fn frag(tag: u64) -> Fragment {
        Fragment::new(
            AppPc(tag),
            4,
            Partition::Shared,
            None,
            CacheSlot {
                unit: UnitId(0),
                pc: CachePc(0x1000 + tag),
                offset: 0,
                len: 4,
            },
            FragmentFlags::SHARED,
            Vec::new(),
            TranslationTable::new(),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let slab = FragmentSlab::new();
        let id = slab.insert(frag(0x100));
        assert_eq!(slab.get(id).unwrap().tag(), AppPc(0x100));
        let removed = slab.remove(id).unwrap();
        assert_eq!(removed.tag(), AppPc(0x100));
        assert!(slab.get(id).is_none(), "removed id must not resolve");
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let slab = FragmentSlab::new();
        let id = slab.insert(frag(0x100));
        slab.remove(id);
        let id2 = slab.insert(frag(0x200));
        assert_eq!(id2.index(), id.index(), "slot must be reused");
        assert_ne!(id2.generation(), id.generation());
        assert!(slab.get(id).is_none(), "stale generation must miss");
        assert_eq!(slab.get(id2).unwrap().tag(), AppPc(0x200));
    }

    #[test]
    fn test_pin_keeps_record_alive() {
        let slab = FragmentSlab::new();
        let id = slab.insert(frag(0x100));
        let pin = slab.get(id).unwrap();
        slab.remove(id);
        assert_eq!(pin.tag(), AppPc(0x100), "pinned record survives removal");
    }
}
