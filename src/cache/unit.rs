//! One contiguous cache region, bump-filled with fragment bodies.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock,
};

use crate::{
    arch::CachePc,
    cache::{CacheSlot, Partition},
    fragment::FragmentId,
    os::ThreadId,
};

/// Identifier of a cache unit, stable for the process lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct UnitId(pub u32);

/// A contiguous executable region owned by the cache.
///
/// Fragment bodies are bump-appended; bytes are immutable once committed
/// (all later mutation goes through atomic exit slots on the fragment record,
/// never through the code bytes). A unit is reclaimable only when no live
/// fragment remains registered in it and every thread has passed a safe
/// point since its retirement.
pub struct Unit {
    id: UnitId,
    partition: Partition,
    owner: Option<ThreadId>,
    base: u64,
    capacity: usize,
    seq: u64,
    code: RwLock<Vec<u8>>,
    /// (offset, len, fragment), kept sorted by offset.
    frags: RwLock<Vec<(u32, u32, FragmentId)>>,
    retired: AtomicBool,
    released: AtomicBool,
}

impl Unit {
    pub(crate) fn new(
        id: UnitId,
        partition: Partition,
        owner: Option<ThreadId>,
        base: u64,
        capacity: usize,
        seq: u64,
    ) -> Self {
        Unit {
            id,
            partition,
            owner,
            base,
            capacity,
            seq,
            code: RwLock::new(Vec::with_capacity(capacity)),
            frags: RwLock::new(Vec::new()),
            retired: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// A read-only unit whose bytes come from a mapped module cache.
    pub(crate) fn frozen(id: UnitId, base: u64, bytes: Vec<u8>, seq: u64) -> Self {
        let capacity = bytes.len();
        let unit = Unit::new(id, Partition::Frozen, None, base, capacity, seq);
        *write_lock!(unit.code) = bytes;
        // Frozen units are never bump-filled.
        unit.retired.store(true, Ordering::Release);
        unit
    }

    /// Unit identifier.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Partition the unit belongs to.
    #[must_use]
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Owning thread for private units.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Base cache address.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Reserved capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creation sequence number; lower is older (FIFO eviction order).
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether `pc` falls inside this unit's address range.
    #[must_use]
    pub fn contains(&self, pc: CachePc) -> bool {
        pc.0 >= self.base && pc.0 < self.base + self.capacity as u64 && !self.is_released()
    }

    /// Appends `bytes`, returning the slot, or `None` when the unit is
    /// retired or out of room.
    pub(crate) fn try_append(&self, bytes: &[u8]) -> Option<CacheSlot> {
        if self.retired.load(Ordering::Acquire) {
            return None;
        }
        let mut code = write_lock!(self.code);
        if code.len() + bytes.len() > self.capacity {
            return None;
        }
        let offset = code.len() as u32;
        code.extend_from_slice(bytes);
        Some(CacheSlot {
            unit: self.id,
            pc: CachePc(self.base + u64::from(offset)),
            offset,
            len: bytes.len() as u32,
        })
    }

    /// Copies committed bytes starting at `offset` into `buf`; returns the
    /// number of bytes copied.
    pub(crate) fn read(&self, offset: u32, buf: &mut [u8]) -> usize {
        let code = read_lock!(self.code);
        let offset = offset as usize;
        if offset >= code.len() {
            return 0;
        }
        let n = buf.len().min(code.len() - offset);
        buf[..n].copy_from_slice(&code[offset..offset + n]);
        n
    }

    pub(crate) fn register_fragment(&self, offset: u32, len: u32, frag: FragmentId) {
        let mut frags = write_lock!(self.frags);
        let pos = frags.partition_point(|&(off, _, _)| off < offset);
        frags.insert(pos, (offset, len, frag));
    }

    pub(crate) fn unregister_fragment(&self, frag: FragmentId) {
        write_lock!(self.frags).retain(|&(_, _, f)| f != frag);
    }

    /// The fragment whose body covers the byte at `offset`.
    #[must_use]
    pub fn fragment_at(&self, offset: u32) -> Option<FragmentId> {
        let frags = read_lock!(self.frags);
        let idx = frags.partition_point(|&(off, _, _)| off <= offset);
        let &(off, len, frag) = frags.get(idx.checked_sub(1)?)?;
        (offset < off + len).then_some(frag)
    }

    /// Fragments registered in this unit, in placement order.
    #[must_use]
    pub fn fragments(&self) -> Vec<FragmentId> {
        read_lock!(self.frags).iter().map(|&(_, _, f)| f).collect()
    }

    /// Marks the unit retired: no further placements.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Whether the unit has been retired for reclaim.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Whether the unit's memory has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Drops the code bytes and returns the capacity to refund.
    pub(crate) fn release(&self) -> usize {
        self.released.store(true, Ordering::Release);
        let mut code = write_lock!(self.code);
        code.clear();
        code.shrink_to_fit();
        self.capacity
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id.0)
            .field("partition", &self.partition)
            .field("base", &format_args!("{:#x}", self.base))
            .field("fill", &read_lock!(self.code).len())
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Unit {
        Unit::new(UnitId(0), Partition::Shared, None, 0x1000, 64, 0)
    }

    #[test]
    fn test_append_until_full() {
        let u = unit();
        let a = u.try_append(&[0; 40]).unwrap();
        assert_eq!(a.offset, 0);
        let b = u.try_append(&[0; 20]).unwrap();
        assert_eq!(b.offset, 40);
        assert!(u.try_append(&[0; 8]).is_none(), "64-byte unit is full");
    }

    #[test]
    fn test_retired_rejects_appends() {
        let u = unit();
        u.retire();
        assert!(u.try_append(&[0; 1]).is_none());
    }

    #[test]
    fn test_fragment_at_boundaries() {
        let u = unit();
        let a = u.try_append(&[0; 10]).unwrap();
        let b = u.try_append(&[0; 10]).unwrap();
        let fa = FragmentId::from_raw(1, 0);
        let fb = FragmentId::from_raw(2, 0);
        u.register_fragment(a.offset, a.len, fa);
        u.register_fragment(b.offset, b.len, fb);

        assert_eq!(u.fragment_at(0), Some(fa));
        assert_eq!(u.fragment_at(9), Some(fa));
        assert_eq!(u.fragment_at(10), Some(fb));
        assert_eq!(u.fragment_at(19), Some(fb));
        assert_eq!(u.fragment_at(20), None);
    }
}
