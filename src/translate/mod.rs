//! Translation: the inverse map from cache state back to application state.
//!
//! Every fragment carries a [`TranslationTable`]: a list of spans sorted by
//! cache offset, each mapping a range of cache bytes to the application
//! address they came from, together with a [`Recipe`] describing where the
//! application's register values currently live (still in their registers,
//! in a spill slot, or as a known constant). The same machinery serves two
//! masters: the async interposer, which must hand the application's own
//! handler a context it could have seen natively, and synchall, which must
//! teleport suspended threads out of the cache.
//!
//! # Restartable Boundaries
//!
//! A cache PC inside a mangling sequence (for example partway through an
//! indirect-branch lookup) does not correspond to any application state. Each
//! mangling span records the application PC chosen as its restartable
//! boundary when the sequence was emitted; translation rewinds (or advances)
//! to that boundary. A span with no boundary is a bug state and reports
//! [`crate::Error::Untranslatable`].

use crate::{
    arch::{AppPc, CachePc, Mcontext, Reg},
    Error, Result,
};

/// Where one application register's value lives at a given cache PC.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecipeSource {
    /// The value is still in the register itself.
    InSelf,
    /// The value was moved to another register.
    InReg(Reg),
    /// The value sits in the per-thread spill area at this slot.
    Spill(u8),
    /// The value is a known constant at this point.
    Const(u64),
}

/// One register-restore rule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegRule {
    /// Register being described.
    pub reg: Reg,
    /// Where its application value lives.
    pub source: RecipeSource,
}

/// How to reconstruct application register state from machine state.
///
/// An empty recipe is the identity: every register already holds its
/// application value. `sp_adjust` undoes engine-synthesized stack motion
/// (e.g. a return address pushed by call mangling that the application never
/// executed).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Recipe {
    /// Register rules, applied in order.
    pub rules: Vec<RegRule>,
    /// Signed adjustment added to the stack pointer.
    pub sp_adjust: i64,
}

impl Recipe {
    /// The identity recipe.
    #[must_use]
    pub fn identity() -> Self {
        Recipe::default()
    }

    /// Applies the recipe to `mc` in place, reading spill slots from
    /// `spills`.
    pub fn apply(&self, mc: &mut Mcontext, spills: &[u64]) {
        let snapshot = mc.clone();
        for rule in &self.rules {
            let value = match rule.source {
                RecipeSource::InSelf => snapshot.reg(rule.reg),
                RecipeSource::InReg(src) => snapshot.reg(src),
                RecipeSource::Spill(slot) => spills.get(slot as usize).copied().unwrap_or(0),
                RecipeSource::Const(v) => v,
            };
            mc.set_reg(rule.reg, value);
        }
        mc.sp = mc.sp.wrapping_add_signed(self.sp_adjust);
    }
}

/// What a span of cache bytes corresponds to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanKind {
    /// A copied application instruction; a PC inside it rewinds to the
    /// instruction start.
    App,
    /// An engine mangling sequence; a PC inside it resolves to the recorded
    /// restartable boundary.
    Mangle {
        /// Application PC of the pre-chosen restartable boundary.
        restart: AppPc,
    },
    /// An engine sequence with no valid application state; translation from
    /// inside it is a bug.
    Opaque,
}

/// One sorted span of a fragment's translation table.
#[derive(Clone, Debug)]
pub struct TranslationEntry {
    /// Start offset within the fragment body.
    pub cache_off: u32,
    /// Application address this span represents.
    pub app: AppPc,
    /// Span classification.
    pub kind: SpanKind,
    /// Register-restore recipe in force throughout the span.
    pub recipe: Recipe,
}

/// Per-fragment map from cache offsets back to application state.
///
/// Built alongside emission; spans are pushed in ascending cache-offset
/// order and never mutated afterwards.
#[derive(Clone, Debug, Default)]
pub struct TranslationTable {
    entries: Vec<TranslationEntry>,
    /// Total body length, closing the final span.
    body_len: u32,
}

impl TranslationTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        TranslationTable::default()
    }

    /// Appends a span starting at `cache_off`.
    ///
    /// Offsets must arrive in ascending order; out-of-order pushes indicate a
    /// builder bug and are ignored in release builds.
    pub fn push(&mut self, cache_off: u32, app: AppPc, kind: SpanKind, recipe: Recipe) {
        debug_assert!(self
            .entries
            .last()
            .map_or(true, |prev| prev.cache_off <= cache_off));
        self.entries.push(TranslationEntry {
            cache_off,
            app,
            kind,
            recipe,
        });
    }

    /// Records the final body length, closing the last span.
    pub fn seal(&mut self, body_len: u32) {
        self.body_len = body_len;
    }

    /// The span covering `offset`, by binary search.
    #[must_use]
    pub fn span_at(&self, offset: u32) -> Option<&TranslationEntry> {
        if offset >= self.body_len && self.body_len != 0 {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.cache_off <= offset);
        self.entries.get(idx.checked_sub(1)?)
    }

    /// Translates a machine context whose PC is at `offset` within the
    /// fragment body into application state.
    ///
    /// `cache_pc` is only used for error reporting; `spills` is the owning
    /// thread's spill area.
    ///
    /// # Errors
    ///
    /// [`Error::Untranslatable`] when the offset falls in an [`SpanKind::Opaque`]
    /// span or outside the body.
    pub fn translate(
        &self,
        offset: u32,
        cache_pc: CachePc,
        mc: &Mcontext,
        spills: &[u64],
    ) -> Result<Mcontext> {
        let span = self.span_at(offset).ok_or(Error::Untranslatable(cache_pc))?;
        let app_pc = match span.kind {
            SpanKind::App => span.app,
            SpanKind::Mangle { restart } => restart,
            SpanKind::Opaque => return Err(Error::Untranslatable(cache_pc)),
        };
        let mut out = mc.clone();
        span.recipe.apply(&mut out, spills);
        out.pc = app_pc.0;
        Ok(out)
    }

    /// Number of spans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no spans.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the spans in cache-offset order.
    pub fn iter(&self) -> impl Iterator<Item = &TranslationEntry> {
        self.entries.iter()
    }
}
