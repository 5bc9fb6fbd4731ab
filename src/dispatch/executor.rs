//! The cache-execution seam.
//!
//! Entering the cache is the platform-specific half of the engine: restore
//! application registers, jump to a fragment entry, and come back with the
//! reason for the exit. The engine core drives that through the
//! [`CacheExecutor`] trait; production backends perform the real context
//! switch, and the crate's test suite plugs in an interpreter over the test
//! ISA that honors exactly the same contract.
//!
//! The contract: execution starts at `entry` inside fragment `frag`,
//! follows linked exits and indirect-lookup hits while `follow_links` is
//! set, and returns at the first event dispatch must see. On
//! [`ExecExit::Fault`] and [`ExecExit::Interrupted`] the context's `pc`
//! holds the cache PC of the interruption point, ready for translation; on
//! every other exit the target information in the variant is authoritative
//! and `pc` is not meaningful.

use std::sync::{atomic::AtomicBool, Mutex};

use crate::{
    arch::{AppPc, CachePc, FaultKind, Mcontext},
    cache::CodeCache,
    fragment::{FragmentId, FragmentSlab},
    ibl::IblTable,
    os::OsFacade,
    thread::SPILL_SLOTS,
    Result,
};

/// Everything the executor may touch while the thread is in the cache.
pub struct ExecEnv<'a> {
    /// Cache bytes.
    pub cache: &'a CodeCache,
    /// Fragment records (exit slots, translation spans).
    pub slab: &'a FragmentSlab,
    /// Indirect-branch lookup table.
    pub ibl: &'a IblTable,
    /// Application memory access.
    pub os: &'a dyn OsFacade,
    /// Checked between fragments; when set, the executor returns
    /// [`ExecExit::Interrupted`] at the next boundary.
    pub interrupt: &'a AtomicBool,
    /// The owning thread's mangling spill slots.
    pub spills: &'a Mutex<[u64; SPILL_SLOTS]>,
    /// Follow linked exits and lookup hits in-cache. Cleared while a trace
    /// is being recorded so dispatch regains control after every block.
    pub follow_links: bool,
}

/// Why control came back from the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecExit {
    /// An unlinked direct exit: dispatch resolves the target.
    Stub {
        /// Fragment whose exit was taken.
        frag: FragmentId,
        /// Exit index within it.
        exit: u32,
    },
    /// A linked direct exit was taken while `follow_links` was off.
    Branched {
        /// Fragment whose exit was taken.
        frag: FragmentId,
        /// Exit index within it.
        exit: u32,
        /// Cache entry the link points at.
        next: CachePc,
    },
    /// The indirect-branch lookup missed; the dynamic target is preserved.
    IndirectMiss {
        /// Application target the lookup failed to resolve.
        target: AppPc,
    },
    /// The indirect-branch lookup hit while `follow_links` was off.
    IndirectHit {
        /// Fragment the probe ran in.
        frag: FragmentId,
        /// Cache entry of the resolved target.
        next: CachePc,
    },
    /// A system-call exit stub was reached.
    Syscall {
        /// Fragment whose exit was taken.
        frag: FragmentId,
        /// Exit index within it.
        exit: u32,
    },
    /// An architectural fault inside the cache (data access or a synthetic
    /// re-raise). `mc.pc` holds the faulting cache PC.
    Fault {
        /// Fragment the fault occurred in.
        frag: FragmentId,
        /// Faulting cache PC (also in `mc.pc`).
        cache_pc: CachePc,
        /// Fault classification.
        kind: FaultKind,
    },
    /// The interrupt flag was observed at a fragment boundary. `mc.pc`
    /// holds the boundary cache PC.
    Interrupted {
        /// Fragment execution stopped in front of.
        frag: FragmentId,
        /// Boundary cache PC (also in `mc.pc`).
        cache_pc: CachePc,
    },
}

/// Executes cache bytes with application register state.
pub trait CacheExecutor: Send + Sync {
    /// Runs from `entry` (inside `frag`) until an exit dispatch must see.
    ///
    /// # Errors
    ///
    /// Only engine-internal corruption (undecodable *cache* bytes) errors;
    /// it routes to the fatal path. Application faults are an
    /// [`ExecExit::Fault`], not an error.
    fn enter(
        &self,
        env: &mut ExecEnv<'_>,
        mc: &mut Mcontext,
        entry: CachePc,
        frag: FragmentId,
    ) -> Result<ExecExit>;
}
