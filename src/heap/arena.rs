//! Recycling arenas and executable-space accounting.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use crate::{Error, Result};

/// Default capacity handed out for a fresh scratch buffer.
const SCRATCH_DEFAULT_CAP: usize = 4 * 1024;

/// Upper bound on buffers kept in one arena's free pool.
const POOL_LIMIT: usize = 8;

/// A per-thread recycling arena for build-time scratch buffers.
///
/// Owned exclusively by one thread context; no synchronization. Buffers are
/// leased for the duration of one fragment build and recycled afterwards, so
/// repeated builds reuse the same allocations.
#[derive(Debug, Default)]
pub struct ThreadArena {
    pool: Vec<Vec<u8>>,
    leased: usize,
    peak_leased: usize,
}

impl ThreadArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases a cleared scratch buffer with at least `cap` capacity.
    #[must_use]
    pub fn lease(&mut self, cap: usize) -> Vec<u8> {
        self.leased += 1;
        self.peak_leased = self.peak_leased.max(self.leased);
        match self.pool.iter().position(|b| b.capacity() >= cap) {
            Some(idx) => {
                let mut buf = self.pool.swap_remove(idx);
                buf.clear();
                buf
            }
            None => Vec::with_capacity(cap.max(SCRATCH_DEFAULT_CAP)),
        }
    }

    /// Returns a leased buffer to the pool.
    pub fn recycle(&mut self, buf: Vec<u8>) {
        self.leased = self.leased.saturating_sub(1);
        if self.pool.len() < POOL_LIMIT {
            self.pool.push(buf);
        }
    }

    /// Number of buffers currently leased out.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.leased
    }

    /// High-water mark of simultaneous leases.
    #[must_use]
    pub fn peak_leased(&self) -> usize {
        self.peak_leased
    }
}

/// A process-shared arena with the same recycling contract as
/// [`ThreadArena`], behind a mutex.
///
/// Used by callers that have no thread context of their own, such as the
/// freezer when serializing module caches.
#[derive(Debug, Default)]
pub struct SharedArena {
    inner: Mutex<ThreadArena>,
}

impl SharedArena {
    /// Creates an empty shared arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases a cleared scratch buffer with at least `cap` capacity.
    #[must_use]
    pub fn lease(&self, cap: usize) -> Vec<u8> {
        lock!(self.inner).lease(cap)
    }

    /// Returns a leased buffer to the pool.
    pub fn recycle(&self, buf: Vec<u8>) {
        lock!(self.inner).recycle(buf);
    }
}

/// Byte budget for one executable partition.
///
/// The code cache charges the budget when it reserves a unit and refunds it
/// when a unit is released. Charging never blocks; exceeding the limit is the
/// signal to run eviction.
#[derive(Debug)]
pub struct ExecBudget {
    limit: usize,
    used: AtomicUsize,
}

impl ExecBudget {
    /// A budget capped at `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        ExecBudget {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Attempts to charge `bytes` against the budget.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfCache`] when the charge would exceed the limit; the
    /// caller evicts and retries once before surfacing the error.
    pub fn charge(&self, bytes: usize) -> Result<()> {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(bytes);
            if next > self.limit {
                return Err(Error::OutOfCache);
            }
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Refunds a previous charge.
    pub fn refund(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// The configured limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_recycles_buffers() {
        let mut arena = ThreadArena::new();
        let mut buf = arena.lease(64);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        arena.recycle(buf);

        let again = arena.lease(64);
        assert_eq!(again.len(), 0, "recycled buffer must come back cleared");
        assert_eq!(again.as_ptr(), ptr, "recycled buffer must be reused");
    }

    #[test]
    fn test_arena_lease_tracking() {
        let mut arena = ThreadArena::new();
        let a = arena.lease(16);
        let b = arena.lease(16);
        assert_eq!(arena.leased(), 2);
        arena.recycle(a);
        arena.recycle(b);
        assert_eq!(arena.leased(), 0);
        assert_eq!(arena.peak_leased(), 2);
    }

    #[test]
    fn test_budget_charge_and_refund() {
        let budget = ExecBudget::new(100);
        budget.charge(60).unwrap();
        assert!(budget.charge(60).is_err());
        budget.refund(60);
        budget.charge(100).unwrap();
        assert_eq!(budget.used(), 100);
    }
}
