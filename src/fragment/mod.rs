//! Fragments: the unit of caching, lookup, linking, and eviction.
//!
//! A fragment is one cached translation of application code: a basic block
//! or a trace. Its identity is the application PC it was built from (the
//! *tag*); its body lives in a code-cache unit; its outgoing control flow
//! goes through patchable [`Exit`] slots; and its [`TranslationTable`]
//! (see [`crate::translate`]) maps every body byte back to application state.
//!
//! Fragments live in a [`FragmentSlab`]: a dense-id arena with generation
//! counters. Everything that refers to a fragment across threads carries a
//! [`FragmentId`], not a pointer; eviction bumps the generation, turning
//! stale ids into lookup misses instead of dangling references. The
//! `Arc<Fragment>` handed out by the slab doubles as the pin that keeps a
//! fragment's record alive while a concurrent reader still holds it.
//!
//! # Key Components
//!
//! - [`Fragment`] - The record itself
//! - [`FragmentFlags`] - Sharing, trace, linkability, and flush state
//! - [`Exit`] / [`ExitTarget`] - Patchable outgoing control transfers
//! - [`FragmentSlab`] - The id-to-record arena
//! - [`FragmentBuilder`](crate::fragment::FragmentBuilder) - Decodes and
//!   mangles one basic block (see [`builder`])

mod builder;
mod record;
mod slab;

pub use builder::{BuildSpec, BuiltBlock, FragmentBuilder, MAX_BLOCK_INSTRS};
pub(crate) use builder::Emitter;
pub use record::{Exit, ExitTarget, ExitWord, Fragment, FragmentFlags, IncomingLink, TraceState};
pub use slab::{FragmentId, FragmentSlab};
