//! The engine's configuration surface.
//!
//! Options are plain data with fluent setters; parsing a command line or an
//! options string into them belongs to the embedding layer, not the core.
//! Defaults are conservative: shared basic blocks, tracing on, persistence
//! and detach off.

use std::time::Duration;

use crate::cache::CacheLimits;
use crate::synch::DEFAULT_SYNCH_TIMEOUT;

/// Where injection happens relative to the application's loader.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum InjectLocation {
    /// Take over before the loader has run (earliest interposition).
    #[default]
    PreLoader,
    /// Take over after the loader finished (reduced transparency, simpler
    /// bootstrapping).
    PostLoader,
}

/// Options recognized by the engine.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Attempt to inject into child processes at creation time.
    pub follow_children: bool,
    /// Use the pre-loader takeover path.
    pub early_inject: bool,
    /// Takeover point when `early_inject` is not decisive.
    pub inject_location: InjectLocation,
    /// Load frozen per-module caches when present.
    pub use_persisted: bool,
    /// Freeze module caches at process exit.
    pub coarse_enable_freeze: bool,
    /// Execution count at which a basic block becomes a trace head. Zero
    /// disables tracing.
    pub trace_threshold: u32,
    /// Hard limit on blocks per trace.
    pub trace_max_blocks: usize,
    /// Permit runtime detach via nudge.
    pub detach_allowed: bool,
    /// On fatal error, produce an in-process memory snapshot record.
    pub live_dump: bool,
    /// On fatal error, spawn this external tool instead (takes precedence
    /// over `live_dump`).
    pub external_dump: Option<String>,
    /// When false, thread-creation interception is delayed until the first
    /// OS-level thread-attach notification (reduced transparency).
    pub asynch: bool,
    /// Build per-thread private basic blocks instead of shared ones.
    pub private_blocks: bool,
    /// Cap on decoded instructions per basic block.
    pub max_block_instrs: usize,
    /// Cache partition sizing.
    pub cache: CacheLimits,
    /// Cooperative synchall wait bound before forced suspension.
    pub synch_timeout: Duration,
    /// Indirect-branch lookup table size, as a power-of-two exponent.
    pub ibl_bits: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            follow_children: false,
            early_inject: true,
            inject_location: InjectLocation::PreLoader,
            use_persisted: false,
            coarse_enable_freeze: false,
            trace_threshold: 50,
            trace_max_blocks: 32,
            detach_allowed: false,
            live_dump: false,
            external_dump: None,
            asynch: true,
            private_blocks: false,
            max_block_instrs: crate::fragment::MAX_BLOCK_INSTRS,
            cache: CacheLimits::default(),
            synch_timeout: DEFAULT_SYNCH_TIMEOUT,
            ibl_bits: 12,
        }
    }
}

impl EngineOptions {
    /// Sets the trace-head threshold.
    #[must_use]
    pub fn with_trace_threshold(mut self, threshold: u32) -> Self {
        self.trace_threshold = threshold;
        self
    }

    /// Disables trace building entirely.
    #[must_use]
    pub fn without_traces(mut self) -> Self {
        self.trace_threshold = 0;
        self
    }

    /// Permits runtime detach.
    #[must_use]
    pub fn with_detach(mut self) -> Self {
        self.detach_allowed = true;
        self
    }

    /// Enables loading and freezing of persisted module caches.
    #[must_use]
    pub fn with_persistence(mut self) -> Self {
        self.use_persisted = true;
        self.coarse_enable_freeze = true;
        self
    }

    /// Uses per-thread private basic blocks.
    #[must_use]
    pub fn with_private_blocks(mut self) -> Self {
        self.private_blocks = true;
        self
    }

    /// Replaces the cache sizing.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheLimits) -> Self {
        self.cache = cache;
        self
    }
}
