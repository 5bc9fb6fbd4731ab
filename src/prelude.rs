//! # shepherd Prelude
//!
//! This module provides a convenient prelude for the most commonly used
//! types and traits, allowing embedders and tools to glob-import the
//! working set:
//!
//! ```rust,ignore
//! use shepherd::prelude::*;
//! ```

pub use crate::arch::{
    AppPc, CachePc, ControlKind, DecodedInstr, FaultKind, InstrDecoder, InstrEncoder, Isa,
    Mcontext, Reg, NUM_GPRS,
};
pub use crate::cache::{CacheLimits, CodeCache, Partition};
pub use crate::config::{EngineOptions, InjectLocation};
pub use crate::dispatch::{CacheExecutor, ExecEnv, ExecExit, ThreadOutcome};
pub use crate::engine::{
    DiagnosticRecord, Engine, EngineBuilder, InjectorFrame, INJECTOR_SENTINEL,
};
pub use crate::fragment::{FragmentFlags, FragmentId};
pub use crate::interpose::PcSite;
pub use crate::os::{
    ExceptionRecord, OsFacade, OsRegion, Protection, RegionInfo, SyscallOutcome, ThreadId,
};
pub use crate::persist::ModuleInfo;
pub use crate::wrap::{
    GlobalWrapFlags, WrapContext, WrapFlags, WrapPhase, WrapRequest,
};
pub use crate::{Error, Result};
