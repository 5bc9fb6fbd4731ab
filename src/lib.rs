// Copyright 2024-2026 the shepherd authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # shepherd
//!
//! A process-virtualization engine core. shepherd interposes on every
//! application instruction by copying code into a private software code cache
//! and executing only the cache copies, so that observation, instrumentation,
//! and transformation can be performed while preserving the original program
//! semantics. The engine runs in the same address space as the application and
//! shepherds all of its threads for the entire process lifetime.
//!
//! # Architecture
//!
//! The crate is organized into modules that mirror the runtime pipeline:
//!
//! - **Arch Layer**: Architecture-neutral instruction model and the
//!   decoder/encoder traits the fragment builder consumes
//! - **OS Layer**: Facade traits for virtual memory, thread suspension, and
//!   exception-hook installation, so the engine core stays host-agnostic
//! - **Fragment Layer**: Basic-block building, control-transfer mangling, and
//!   the dense-id fragment slab
//! - **Cache Layer**: Code-cache units per partition with FIFO-with-watermark
//!   eviction
//! - **Lookup Layer**: Per-thread and process-shared fragment tables plus the
//!   lossy in-cache indirect-branch table
//! - **Dispatch Layer**: The engine-side loop run between fragment exits,
//!   including the context-switch records on either side
//! - **Trace Layer**: Hot-path detection and superblock emission
//! - **Event Layer**: Signal/exception interception, cache-PC translation,
//!   and deferred delivery queues
//! - **Wrap Layer**: Deterministic pre/post callbacks and function
//!   replacement, correct under longjmp- and exception-style unwinds
//!
//! ## Key Components
//!
//! - [`crate::engine::Engine`] - The engine handle owning all shared state
//! - [`crate::fragment::FragmentBuilder`] - Decodes one basic block and emits
//!   a semantically equivalent cache fragment
//! - [`crate::cache::CodeCache`] - Owns cache memory, places fragments,
//!   evicts units to make space
//! - [`crate::table::SharedTable`] - The process-shared fragment table under a
//!   sequence lock
//! - [`crate::link::Linker`] - Patches direct branches between fragments and
//!   maintains incoming-link lists
//! - [`crate::dispatch::Dispatcher`] - Selects, builds, and enters fragments
//! - [`crate::translate::TranslationTable`] - Maps cache PCs back to
//!   application PCs and register state
//! - [`crate::trace::TraceManager`] - Stitches hot basic blocks into traces
//! - [`crate::synch::Synchall`] - Stops every other thread at a safe point
//! - [`crate::interpose::Interposer`] - Owns asynchronous-event redirection
//! - [`crate::wrap::WrapManager`] - Function wrapping and replacement
//! - [`crate::Error`] and [`crate::Result`] - Crate-wide error handling
//!
//! # Usage Examples
//!
//! ## Taking over a process image
//!
//! ```rust,ignore
//! use shepherd::prelude::*;
//!
//! let engine = Engine::builder()
//!     .isa(my_isa)
//!     .os(my_os_facade)
//!     .executor(my_backend)
//!     .options(EngineOptions::default().with_trace_threshold(50))
//!     .build()?;
//!
//! // Begin dispatch at the application PC captured by the injector.
//! engine.start_thread(saved_context)?;
//! ```
//!
//! ## Wrapping an application function
//!
//! ```rust,ignore
//! use shepherd::prelude::*;
//!
//! engine.wrap(
//!     WrapRequest::new(func_pc)
//!         .pre(|ctx| { ctx.set_arg(0, 42); })
//!         .post(|ctx| { let v = ctx.retval(); ctx.set_retval(v.wrapping_neg()); }),
//! )?;
//! ```
//!
//! # Thread Safety
//!
//! Every application thread runs its own dispatch loop; the engine has no
//! scheduler thread of its own. Shared state is confined to the fragment
//! table (sequence lock), the code-cache unit list (exclusive lock held only
//! for allocation and reclaim), per-fragment link lists (short exclusive
//! sections), and the synchall protocol (one global lock, one synchall in
//! flight). Lock acquisition follows a fixed rank order; see
//! [`crate::synch`] for the ordering rules.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod arch;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod fragment;
pub mod heap;
pub mod ibl;
pub mod interpose;
pub mod link;
pub mod os;
pub mod persist;
pub mod prelude;
pub mod synch;
pub mod table;
pub mod thread;
pub mod toy;
pub mod trace;
pub mod translate;
pub mod wrap;

pub use error::{Error, Result};

pub use arch::{AppPc, CachePc, Mcontext, NUM_GPRS};
pub use config::EngineOptions;
pub use engine::{Engine, EngineBuilder};
pub use fragment::{FragmentFlags, FragmentId};
