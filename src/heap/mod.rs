//! Engine heap: per-thread scratch arenas, a shared arena, and the
//! executable-space budgets charged by the code cache.
//!
//! Fragment building is allocation-heavy and short-lived: every block build
//! needs a scratch code buffer and a translation scratch list, all discarded
//! or copied out at commit. The arenas here recycle those buffers so the
//! steady state allocates nothing. The [`ExecBudget`] type is the accounting
//! half of the executable heap: cache partitions charge it when reserving
//! units and refund it on reclaim.
//!
//! The original engine also re-protected its data sections around every
//! write; with an explicit engine handle whose fields are private by
//! construction, that dance has no equivalent here.

mod arena;

pub use arena::{ExecBudget, SharedArena, ThreadArena};
