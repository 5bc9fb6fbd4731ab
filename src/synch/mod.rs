//! Synchall: stopping every other thread at a safe point.
//!
//! Cache-unit reclamation, fragment flush, trace side effects, and detach
//! all need every other thread observably outside the affected cache code.
//! The protocol has two rungs:
//!
//! 1. **Cooperative**: the synchronizer sets each peer's synch-request and
//!    interrupt flags; peers notice at their next cache exit, park, and
//!    acknowledge. A thread blocked in a system call issued through the
//!    engine's hooks is already "at safe point, in kernel" and needs no
//!    acknowledgement.
//! 2. **Forced**: when the cooperative wait exceeds its bound, the
//!    synchronizer asks the host to suspend the straggler and inspects its
//!    register context. A PC inside a cache fragment is translated back to
//!    application state and the saved context rewritten, teleporting the
//!    thread out of the cache. A host that refuses the suspension gets the
//!    thread skipped, with a log record.
//!
//! One synchall at a time: all synchalls serialize on a single global lock,
//! which also tops the crate-wide lock rank —
//! `synchall-global > shared-cache-unit > shared-fragment-table >
//! per-fragment-link > async-queue`. A would-be synchronizer that loses the
//! lock keeps honoring park requests aimed at itself while it waits, so two
//! synchronizers can never deadlock on each other.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::{
    arch::{CachePc, Mcontext},
    cache::CodeCache,
    fragment::FragmentSlab,
    os::OsFacade,
    thread::{ThreadRegistry, ThreadShared},
    Result,
};

/// Default bound on the cooperative wait per thread.
pub const DEFAULT_SYNCH_TIMEOUT: Duration = Duration::from_millis(500);

/// The safe-point synchronization driver.
pub struct Synchall {
    registry: Arc<ThreadRegistry>,
    global: Mutex<()>,
    timeout: Duration,
}

impl Synchall {
    /// A driver over `registry` with the given cooperative-wait bound.
    #[must_use]
    pub fn new(registry: Arc<ThreadRegistry>, timeout: Duration) -> Self {
        Synchall {
            registry,
            global: Mutex::new(()),
            timeout,
        }
    }

    /// The thread registry this driver synchronizes.
    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    /// Brings every thread except the caller to a safe point, runs `op`,
    /// and releases them.
    ///
    /// `own` is the caller's shared record when the caller is itself a
    /// shepherded thread; it is excluded from the round-up and used to honor
    /// a competing synchronizer's park request while waiting for the global
    /// lock.
    ///
    /// # Errors
    ///
    /// Poisoned global lock only. Per-thread failures degrade: timeout
    /// escalates to forced suspension, and a denied suspension skips the
    /// thread with a warning, per the error-handling design.
    pub fn barrier<R>(
        &self,
        own: Option<&ThreadShared>,
        os: &dyn OsFacade,
        cache: &CodeCache,
        slab: &FragmentSlab,
        op: impl FnOnce() -> R,
    ) -> Result<R> {
        let _guard = loop {
            match self.global.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::WouldBlock) => {
                    if let Some(own) = own {
                        if own.synch_requested() {
                            own.park_at_safe_point();
                        }
                    }
                    std::thread::yield_now();
                }
                Err(TryLockError::Poisoned(_)) => return Err(crate::Error::LockError),
            }
        };

        let peers = match own {
            Some(own) => self.registry.peers(own.tid()),
            None => self.registry.all(),
        };
        for peer in &peers {
            peer.request_synch();
        }

        let mut forced: Vec<crate::os::ThreadId> = Vec::new();
        for peer in &peers {
            let (state, reached) = peer.wait_for_state(self.timeout, |s| s.at_safe_point());
            if reached {
                continue;
            }
            tracing::warn!(tid = %peer.tid(), %state, "cooperative synch timed out, forcing");
            match os.suspend_thread(peer.tid()) {
                Ok(()) => {
                    if let Ok(mc) = os.thread_context(peer.tid()) {
                        if let Some(translated) = translate_out_of_cache(cache, slab, peer, &mc) {
                            let _ = os.set_thread_context(peer.tid(), &translated);
                        }
                    }
                    forced.push(peer.tid());
                }
                Err(err) => {
                    tracing::warn!(tid = %peer.tid(), %err, "forced suspension failed, skipping thread");
                }
            }
        }

        let result = op();

        for peer in &peers {
            peer.release_synch();
        }
        for tid in forced {
            let _ = os.resume_thread(tid);
        }
        Ok(result)
    }
}

/// If `mc.pc` points into a live cache fragment, reconstructs the
/// application context for the suspended owner of `peer`.
fn translate_out_of_cache(
    cache: &CodeCache,
    slab: &FragmentSlab,
    peer: &ThreadShared,
    mc: &Mcontext,
) -> Option<Mcontext> {
    let cache_pc = CachePc(mc.pc);
    let id = cache.fragment_at(cache_pc)?;
    let frag = slab.get(id)?;
    let off = frag.body_offset(cache_pc)?;
    let spills = *lock!(peer.spills);
    frag.translations().translate(off, cache_pc, mc, &spills).ok()
}

impl std::fmt::Debug for Synchall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchall")
            .field("threads", &self.registry.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::CacheLimits,
        os::ThreadId,
        toy::ToyOs,
        thread::{RunState, ThreadContext},
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn driver() -> (Synchall, Arc<ThreadRegistry>, Arc<ToyOs>, CodeCache, FragmentSlab) {
        let registry = Arc::new(ThreadRegistry::new());
        let os = Arc::new(ToyOs::new());
        let cache = CodeCache::new(os.clone(), CacheLimits::default());
        (
            Synchall::new(registry.clone(), Duration::from_millis(100)),
            registry,
            os,
            cache,
            FragmentSlab::new(),
        )
    }

    #[test]
    fn test_barrier_with_no_peers_runs_op() {
        let (synch, _registry, os, cache, slab) = driver();
        let ran = synch
            .barrier(None, os.as_ref(), &cache, &slab, || 42)
            .unwrap();
        assert_eq!(ran, 42);
    }

    #[test]
    fn test_cooperative_peer_parks_until_release() {
        let (synch, registry, os, cache, slab) = driver();
        let tcx = ThreadContext::new(ThreadId(2), Mcontext::default());
        let shared = tcx.shared.clone();
        registry.register(shared.clone());
        // Simulate a thread that is busy in the cache, not at a safe point.
        shared.set_state(RunState::InCache);

        let released = Arc::new(AtomicBool::new(false));
        let observer = released.clone();
        let peer = {
            let shared = shared.clone();
            thread::spawn(move || {
                // Simulate the peer's dispatch loop honoring the request.
                while !shared.synch_requested() {
                    thread::yield_now();
                }
                shared.park_at_safe_point();
                observer.store(true, Ordering::SeqCst);
            })
        };

        synch
            .barrier(None, os.as_ref(), &cache, &slab, || {
                // While the op runs, the peer must be parked, not released.
                assert_eq!(shared.state(), RunState::AtSafePoint);
                assert!(!released.load(Ordering::SeqCst));
            })
            .unwrap();

        peer.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeout_escalates_to_forced_suspension() {
        let (synch, registry, os, cache, slab) = driver();
        // A peer that never reaches a safe point on its own.
        let tcx = ThreadContext::new(ThreadId(9), Mcontext::default());
        tcx.shared.set_state(RunState::InCache);
        registry.register(tcx.shared.clone());
        os.install_thread(ThreadId(9), Mcontext::at(crate::arch::AppPc(0x1234), 0x8000));

        synch
            .barrier(None, os.as_ref(), &cache, &slab, || {})
            .unwrap();
        assert!(os.was_suspended(ThreadId(9)));
        assert!(os.was_resumed(ThreadId(9)));
    }
}
