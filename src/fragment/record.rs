//! The fragment record and its patchable exits.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Mutex,
};

use bitflags::bitflags;

use crate::{
    arch::{AppPc, CachePc, FaultKind},
    cache::{CacheSlot, Partition},
    fragment::FragmentId,
    os::ThreadId,
    translate::TranslationTable,
};

bitflags! {
    /// Fragment state and classification bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FragmentFlags: u32 {
        /// Visible to all threads through the shared table.
        const SHARED = 1 << 0;
        /// A trace fragment rather than a basic block.
        const IS_TRACE = 1 << 1;
        /// Must not be linked into: control has to re-enter dispatch at this
        /// tag (wrapped entries, recorded post-call sites).
        const CANNOT_LINK = 1 << 2;
        /// Backed by a read-only persisted module cache.
        const FROZEN = 1 << 3;
        /// Flush in progress; lookups must lose.
        const BEING_FLUSHED = 1 << 4;
        /// A synthetic fragment that re-raises an architectural fault.
        const SYNTH_FAULT = 1 << 5;
    }
}

/// Trace-related lifecycle of a basic-block fragment.
///
/// `Cold → Warm → Head → Tracing → Retired`, with `Retired → Cold` when a
/// produced trace is dropped. Stored as an atomic byte on the fragment; the
/// `Head → Tracing` edge is a CAS gate that serializes racing promoters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TraceState {
    /// Not yet interesting.
    Cold = 0,
    /// Accumulating hits toward the trace threshold.
    Warm = 1,
    /// Hot enough to head a trace; counting per-predecessor entries.
    Head = 2,
    /// A specific thread is recording from this head.
    Tracing = 3,
    /// A trace was produced from this head.
    Retired = 4,
}

impl TraceState {
    fn from_u8(v: u8) -> TraceState {
        match v {
            1 => TraceState::Warm,
            2 => TraceState::Head,
            3 => TraceState::Tracing,
            4 => TraceState::Retired,
            _ => TraceState::Cold,
        }
    }
}

/// Static classification of one fragment exit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitTarget {
    /// Direct transfer to a known application address (branch target,
    /// fall-through, or call target).
    Direct(AppPc),
    /// Indirect transfer resolved through the in-cache lookup; the exit slot
    /// is only taken on a lookup miss.
    Indirect,
    /// System-call exit; never linked, dispatch performs the call.
    Syscall {
        /// Application address of the instruction after the syscall.
        next: AppPc,
        /// Interrupt vector when the block ended at a software interrupt.
        vector: Option<u8>,
    },
    /// Synthetic fault re-raise; never linked.
    Fault {
        /// The fault to surface.
        kind: FaultKind,
        /// Application address the fault belongs to.
        pc: AppPc,
    },
}

impl ExitTarget {
    /// Whether the linker may ever patch this exit to a fragment.
    #[must_use]
    pub fn linkable(&self) -> bool {
        matches!(self, ExitTarget::Direct(_))
    }
}

/// Decoded state of an exit slot word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitWord {
    /// Unlinked: control exits to dispatch carrying this exit's index.
    Stub(u32),
    /// Linked: control jumps straight to this cache address.
    Linked(CachePc),
}

const LINKED_BIT: u64 = 1 << 63;

/// One patchable outgoing control transfer.
///
/// The slot is a single pointer-sized word flipped atomically between the
/// stub value and a linked cache address. A racing thread observes one value
/// or the other, both valid destinations; the stub route merely costs a
/// dispatch round-trip.
#[derive(Debug)]
pub struct Exit {
    index: u32,
    target: ExitTarget,
    slot: AtomicU64,
}

impl Exit {
    pub(crate) fn new(index: u32, target: ExitTarget) -> Self {
        Exit {
            index,
            target,
            slot: AtomicU64::new(u64::from(index)),
        }
    }

    /// This exit's index within its fragment.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Static target classification.
    #[must_use]
    pub fn target(&self) -> ExitTarget {
        self.target
    }

    /// Reads the current slot word.
    #[must_use]
    pub fn word(&self) -> ExitWord {
        let w = self.slot.load(Ordering::Acquire);
        if w & LINKED_BIT != 0 {
            ExitWord::Linked(CachePc(w & !LINKED_BIT))
        } else {
            ExitWord::Stub(w as u32)
        }
    }

    /// Atomically points the exit at a linked target.
    pub(crate) fn link_to(&self, entry: CachePc) {
        debug_assert!(self.target.linkable());
        self.slot.store(LINKED_BIT | entry.0, Ordering::Release);
    }

    /// Atomically restores the dispatch stub.
    pub(crate) fn unlink(&self) {
        self.slot.store(u64::from(self.index), Ordering::Release);
    }

    /// Whether the exit is currently linked.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        matches!(self.word(), ExitWord::Linked(_))
    }
}

/// A non-owning back-reference from a target fragment to one of the exits
/// that links to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IncomingLink {
    /// Fragment owning the linking exit.
    pub from: FragmentId,
    /// Exit index within `from`.
    pub exit: u32,
}

/// One cached translation of application code.
///
/// See the [module docs](crate::fragment) for the ownership story. All
/// mutable state is behind atomics or the short-section incoming-link lock,
/// so a `Fragment` is shared freely behind `Arc`.
pub struct Fragment {
    tag: AppPc,
    app_len: u32,
    partition: Partition,
    owner: Option<ThreadId>,
    slot: CacheSlot,
    flags: AtomicU32,
    exits: Vec<Exit>,
    links_in: Mutex<Vec<IncomingLink>>,
    xl8: TranslationTable,
    hits: AtomicU32,
    trace_state: AtomicU8,
}

impl Fragment {
    /// Assembles a fragment record around a placed body.
    #[must_use]
    pub fn new(
        tag: AppPc,
        app_len: u32,
        partition: Partition,
        owner: Option<ThreadId>,
        slot: CacheSlot,
        flags: FragmentFlags,
        exit_targets: Vec<ExitTarget>,
        xl8: TranslationTable,
    ) -> Self {
        let exits = exit_targets
            .into_iter()
            .enumerate()
            .map(|(i, t)| Exit::new(i as u32, t))
            .collect();
        Fragment {
            tag,
            app_len,
            partition,
            owner,
            slot,
            flags: AtomicU32::new(flags.bits()),
            exits,
            links_in: Mutex::new(Vec::new()),
            xl8,
            hits: AtomicU32::new(0),
            trace_state: AtomicU8::new(TraceState::Cold as u8),
        }
    }

    /// The application PC this fragment was built from.
    #[must_use]
    pub fn tag(&self) -> AppPc {
        self.tag
    }

    /// Bytes of application code the fragment covers.
    #[must_use]
    pub fn app_len(&self) -> u32 {
        self.app_len
    }

    /// Cache partition the body lives in.
    #[must_use]
    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Owning thread for private fragments.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Where the body lives in the cache.
    #[must_use]
    pub fn slot(&self) -> CacheSlot {
        self.slot
    }

    /// Entry address of the body.
    #[must_use]
    pub fn entry(&self) -> CachePc {
        self.slot.pc
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> FragmentFlags {
        FragmentFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets the given flag bits.
    pub fn set_flags(&self, flags: FragmentFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears the given flag bits.
    pub fn clear_flags(&self, flags: FragmentFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// The exit at `index`.
    #[must_use]
    pub fn exit(&self, index: u32) -> Option<&Exit> {
        self.exits.get(index as usize)
    }

    /// All exits in index order.
    #[must_use]
    pub fn exits(&self) -> &[Exit] {
        &self.exits
    }

    /// The translation table built alongside the body.
    #[must_use]
    pub fn translations(&self) -> &TranslationTable {
        &self.xl8
    }

    /// Offset of `pc` within the body, when it falls inside.
    #[must_use]
    pub fn body_offset(&self, pc: CachePc) -> Option<u32> {
        let off = pc.0.checked_sub(self.slot.pc.0)?;
        (off < u64::from(self.slot.len)).then_some(off as u32)
    }

    /// Runs `f` with the incoming-link list held.
    pub(crate) fn with_links_in<R>(&self, f: impl FnOnce(&mut Vec<IncomingLink>) -> R) -> R {
        f(&mut lock!(self.links_in))
    }

    /// Bumps and returns the execution counter (saturating).
    pub fn record_hit(&self) -> u32 {
        self.hits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                Some(h.saturating_add(1))
            })
            .map(|h| h.saturating_add(1))
            .unwrap_or(u32::MAX)
    }

    /// Current execution count.
    #[must_use]
    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::Acquire)
    }

    /// Current trace state.
    #[must_use]
    pub fn trace_state(&self) -> TraceState {
        TraceState::from_u8(self.trace_state.load(Ordering::Acquire))
    }

    /// Unconditionally stores a trace state.
    pub fn set_trace_state(&self, state: TraceState) {
        self.trace_state.store(state as u8, Ordering::Release);
    }

    /// CAS on the trace state; returns whether the transition won.
    pub fn try_trace_transition(&self, from: TraceState, to: TraceState) -> bool {
        self.trace_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("tag", &self.tag)
            .field("entry", &self.entry())
            .field("partition", &self.partition)
            .field("flags", &self.flags())
            .field("exits", &self.exits.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::UnitId;

    fn slot() -> CacheSlot {
        CacheSlot {
            unit: UnitId(0),
            pc: CachePc(0x1000),
            offset: 0,
            len: 32,
        }
    }

    fn fragment() -> Fragment {
        Fragment::new(
            AppPc(0x400),
            8,
            Partition::Shared,
            None,
            slot(),
            FragmentFlags::SHARED,
            vec![ExitTarget::Direct(AppPc(0x500)), ExitTarget::Indirect],
            TranslationTable::new(),
        )
    }

    #[test]
    fn test_exit_word_flip() {
        let frag = fragment();
        let exit = frag.exit(0).unwrap();
        assert_eq!(exit.word(), ExitWord::Stub(0));
        exit.link_to(CachePc(0x2000));
        assert_eq!(exit.word(), ExitWord::Linked(CachePc(0x2000)));
        exit.unlink();
        assert_eq!(exit.word(), ExitWord::Stub(0));
    }

    #[test]
    fn test_flags_set_and_clear() {
        let frag = fragment();
        assert!(frag.flags().contains(FragmentFlags::SHARED));
        frag.set_flags(FragmentFlags::BEING_FLUSHED);
        assert!(frag.flags().contains(FragmentFlags::BEING_FLUSHED));
        frag.clear_flags(FragmentFlags::BEING_FLUSHED);
        assert!(!frag.flags().contains(FragmentFlags::BEING_FLUSHED));
    }

    #[test]
    fn test_trace_state_cas_gate() {
        let frag = fragment();
        frag.set_trace_state(TraceState::Head);
        assert!(frag.try_trace_transition(TraceState::Head, TraceState::Tracing));
        assert!(
            !frag.try_trace_transition(TraceState::Head, TraceState::Tracing),
            "second promoter must lose the gate"
        );
    }

    #[test]
    fn test_body_offset() {
        let frag = fragment();
        assert_eq!(frag.body_offset(CachePc(0x1000)), Some(0));
        assert_eq!(frag.body_offset(CachePc(0x101f)), Some(31));
        assert_eq!(frag.body_offset(CachePc(0x1020)), None);
        assert_eq!(frag.body_offset(CachePc(0xfff)), None);
    }
}
