//! Fragment tables: the tag-to-fragment maps dispatch lives on.
//!
//! Two flavors share one open-addressing design:
//!
//! - [`PrivateTable`] - owned by a single thread context, no synchronization,
//!   torn down at thread exit.
//! - [`SharedTable`] - process-wide, many concurrent readers against a single
//!   serialized writer. Readers validate a sequence number sampled before and
//!   after the probe and retry on mismatch; writers hold an exclusive lock
//!   and bump the sequence around every mutation. Resize swaps in a doubled
//!   bucket array under the same writer lock, so an insert can never
//!   interleave a resize; readers that straddle the swap observe the
//!   sequence change and retry against the new buckets.
//!
//! Invariant: for any (tag, thread, partition) at most one live entry exists.
//! Both tables resize at 70% load.

mod private;
mod shared;

pub use private::PrivateTable;
pub use shared::SharedTable;

use crate::fragment::FragmentId;

/// Outcome of a table insert.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertOutcome {
    /// The entry was inserted.
    Inserted,
    /// An entry for the tag already exists; the build race was lost.
    AlreadyPresent(FragmentId),
}

/// Fibonacci multiplicative hash of a tag into `1 << bits` buckets.
#[inline]
pub(crate) fn bucket_of(tag: u64, bits: u32) -> usize {
    let h = tag.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> (64 - bits)) as usize
}

/// Load threshold (percent) above which tables double.
pub(crate) const LOAD_PCT: usize = 70;
