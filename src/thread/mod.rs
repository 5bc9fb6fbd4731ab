//! Per-thread engine state and the cross-thread registry.
//!
//! Every application thread the engine shepherds owns a [`ThreadContext`]:
//! the spill area its register state lands in on cache exit, the mangling
//! spill slots, its private fragment table, its build arena, its wrap stack,
//! and its pending-event queue. The context is created by the thread-birth
//! hook before any application code runs and destroyed by the thread-death
//! hook after the last application instruction.
//!
//! The small cross-thread-visible portion lives in [`ThreadShared`]: the run
//! state, the synch-request and interrupt flags, and the parking protocol a
//! synchronizer uses to hold the thread at a safe point. Peers find each
//! other through the [`ThreadRegistry`].
//!
//! The engine-side scratch stack of the original design (the "dstack") is
//! the host call stack here; what remains of it is the reentrancy guard:
//! dispatch is never recursively entered on the same thread.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::{
    arch::Mcontext,
    heap::ThreadArena,
    interpose::{PendingQueue, TryFrames},
    os::ThreadId,
    table::PrivateTable,
    wrap::WrapStack,
};

/// Number of mangling spill slots per thread.
pub const SPILL_SLOTS: usize = 8;

/// Where a thread currently is, from a synchronizer's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum RunState {
    /// Context created, first dispatch not yet taken.
    #[strum(serialize = "born")]
    Born,
    /// Executing engine code between fragments.
    #[strum(serialize = "in-engine")]
    InEngine,
    /// Executing inside the code cache.
    #[strum(serialize = "in-cache")]
    InCache,
    /// Blocked in a system call issued on the application's behalf; counts
    /// as a safe point.
    #[strum(serialize = "in-kernel")]
    InKernel,
    /// Parked at a safe point, acknowledged to a synchronizer.
    #[strum(serialize = "at-safe-point")]
    AtSafePoint,
    /// Thread has run its death hook.
    #[strum(serialize = "exited")]
    Exited,
}

impl RunState {
    /// Whether a synchronizer may examine and mutate this thread's state.
    #[must_use]
    pub fn at_safe_point(&self) -> bool {
        matches!(
            self,
            RunState::AtSafePoint | RunState::InKernel | RunState::Born | RunState::Exited
        )
    }
}

#[derive(Debug)]
struct ThreadFlags {
    state: RunState,
    synch_requested: bool,
}

/// The cross-thread-visible slice of a thread's engine state.
#[derive(Debug)]
pub struct ThreadShared {
    tid: ThreadId,
    flags: Mutex<ThreadFlags>,
    cv: Condvar,
    /// Set to force the executor out of the cache at the next fragment
    /// boundary; cleared by the thread once it reacts.
    pub interrupt: std::sync::atomic::AtomicBool,
    /// Events queued for delivery at this thread's next safe point.
    pub pending: PendingQueue,
    /// Mangling spill slots. Written by the owner from inside the cache;
    /// read by a synchronizer only while it holds the owner suspended.
    pub spills: Mutex<[u64; SPILL_SLOTS]>,
}

impl ThreadShared {
    fn new(tid: ThreadId) -> Self {
        ThreadShared {
            tid,
            flags: Mutex::new(ThreadFlags {
                state: RunState::Born,
                synch_requested: false,
            }),
            cv: Condvar::new(),
            interrupt: std::sync::atomic::AtomicBool::new(false),
            pending: PendingQueue::new(),
            spills: Mutex::new([0; SPILL_SLOTS]),
        }
    }

    /// Host thread id.
    #[must_use]
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        lock!(self.flags).state
    }

    /// Publishes a new run state and wakes anyone waiting on it.
    pub fn set_state(&self, state: RunState) {
        lock!(self.flags).state = state;
        self.cv.notify_all();
    }

    /// Whether a synchronizer has asked this thread to park.
    #[must_use]
    pub fn synch_requested(&self) -> bool {
        lock!(self.flags).synch_requested
    }

    /// Asks the thread to park at its next safe point.
    pub fn request_synch(&self) {
        lock!(self.flags).synch_requested = true;
        self.interrupt
            .store(true, std::sync::atomic::Ordering::Release);
        self.cv.notify_all();
    }

    /// Releases a previously requested park.
    pub fn release_synch(&self) {
        lock!(self.flags).synch_requested = false;
        self.cv.notify_all();
    }

    /// Parks the calling (owning) thread until the synchronizer releases it.
    ///
    /// Publishes [`RunState::AtSafePoint`] as the acknowledgement, then
    /// restores [`RunState::InEngine`] on release.
    pub fn park_at_safe_point(&self) {
        let mut flags = lock!(self.flags);
        flags.state = RunState::AtSafePoint;
        self.cv.notify_all();
        while flags.synch_requested {
            flags = self.cv.wait(flags).expect("thread-flags mutex poisoned across a park");
        }
        flags.state = RunState::InEngine;
        self.cv.notify_all();
    }

    /// Waits until the thread reports a state matching `pred`, up to
    /// `timeout`. Returns the final observed state and whether the predicate
    /// held.
    pub fn wait_for_state(
        &self,
        timeout: Duration,
        pred: impl Fn(RunState) -> bool,
    ) -> (RunState, bool) {
        let mut flags = lock!(self.flags);
        let deadline = std::time::Instant::now() + timeout;
        while !pred(flags.state) {
            let now = std::time::Instant::now();
            if now >= deadline {
                return (flags.state, false);
            }
            let (next, _) = self
                .cv
                .wait_timeout(flags, deadline - now)
                .expect("thread-flags mutex poisoned across a park");
            flags = next;
        }
        (flags.state, true)
    }
}

/// Everything one application thread's dispatch loop owns.
pub struct ThreadContext {
    /// Cross-thread-visible slice.
    pub shared: Arc<ThreadShared>,
    /// The spill area: application register state while the thread is in
    /// engine code.
    pub mc: Mcontext,
    /// Private fragment table.
    pub table: PrivateTable,
    /// Build-scratch arena.
    pub arena: ThreadArena,
    /// Active wrap frames (see [`crate::wrap`]).
    pub wrap_stack: WrapStack,
    /// Guarded-probe frames for expected engine faults.
    pub try_frames: TryFrames,
    /// In-progress trace recording, when this thread holds a head's gate.
    pub tracing: Option<crate::trace::TraceRecorder>,
    /// Dispatch reentrancy guard: the engine-stack discipline.
    pub in_dispatch: bool,
    /// Saved contexts for nested kernel-initiated callback frames; each
    /// callback return unwinds exactly one.
    pub callback_frames: Vec<Mcontext>,
}

impl ThreadContext {
    /// Creates the context for a newborn thread whose first application
    /// instruction is described by `mc`.
    #[must_use]
    pub fn new(tid: ThreadId, mc: Mcontext) -> Self {
        ThreadContext {
            shared: Arc::new(ThreadShared::new(tid)),
            mc,
            table: PrivateTable::new(),
            arena: ThreadArena::new(),
            wrap_stack: WrapStack::new(),
            try_frames: TryFrames::new(),
            tracing: None,
            in_dispatch: false,
            callback_frames: Vec::new(),
        }
    }

    /// Host thread id.
    #[must_use]
    pub fn tid(&self) -> ThreadId {
        self.shared.tid()
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("tid", &self.tid())
            .field("state", &self.shared.state())
            .field("private_frags", &self.table.len())
            .finish()
    }
}

/// The process-wide registry of shepherded threads.
///
/// Synchronizers iterate it to reach every peer; birth and death hooks keep
/// it current.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<ThreadShared>>,
}

impl ThreadRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        ThreadRegistry {
            threads: DashMap::new(),
        }
    }

    /// Registers a newborn thread.
    pub fn register(&self, shared: Arc<ThreadShared>) {
        self.threads.insert(shared.tid(), shared);
    }

    /// Removes a dying thread.
    pub fn unregister(&self, tid: ThreadId) {
        self.threads.remove(&tid);
    }

    /// Snapshot of every registered peer except `excluding`.
    #[must_use]
    pub fn peers(&self, excluding: ThreadId) -> Vec<Arc<ThreadShared>> {
        self.threads
            .iter()
            .filter(|entry| *entry.key() != excluding)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every registered thread.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ThreadShared>> {
        self.threads.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no threads are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
