//! The trace builder: stitching hot basic blocks into superblocks.
//!
//! A basic-block fragment climbs
//! `Cold → Warm → Head → Tracing → Retired` (see
//! [`TraceState`](crate::fragment::TraceState)). Promotion to head unlinks
//! the block's incoming branches and marks it unlinkable, so every entry
//! funnels through dispatch and the hit counter is trustworthy. Once the
//! counter crosses the configured threshold, the next thread to arrive wins
//! the `Head → Tracing` CAS gate and records: each subsequent block executes
//! one at a time (dispatch keeps control between blocks) while the recorder
//! notes the path taken. Recording stops at a branch back to the head (a
//! loop), a return or other indirect transfer, a previously recorded block,
//! a system call, or the length cap; a fault discards the recording.
//!
//! Emission re-decodes the recorded blocks and fuses them: internal direct
//! jumps disappear, conditional branches become guard exits to the off-trace
//! successor, calls keep their synthesized return-address push, and the
//! final block either branches back to the head (loop traces) or keeps its
//! own terminator. Side exits fall back to the basic-block tables. The
//! finished trace replaces the head's shared-table entry; the head block
//! retires.
//!
//! Two threads racing to record from one head serialize on the CAS gate:
//! the loser simply keeps executing normally. A flush of any constituent
//! block discards an in-progress or in-emission trace.

use rustc_hash::FxHashSet;

use crate::{
    arch::{AppPc, ControlKind},
    cache::Partition,
    dispatch::{Dispatcher, ExecExit},
    fragment::{
        Emitter, ExitTarget, Fragment, FragmentFlags, FragmentId, TraceState,
    },
    table::InsertOutcome,
    thread::ThreadContext,
    Error, Result,
};

/// What dispatch should do with the fragment it is about to run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceDirective {
    /// Run normally, following links in-cache.
    Normal,
    /// Stop at the first exit so the recorder sees every block boundary.
    SingleStep,
}

/// One block on a recorded path.
#[derive(Clone, Copy, Debug)]
struct RecordedBlock {
    tag: AppPc,
    id: FragmentId,
    /// Application address control continued to after the block.
    succ: AppPc,
}

/// Per-thread recording state for one in-progress trace.
#[derive(Debug)]
pub struct TraceRecorder {
    head: AppPc,
    head_id: FragmentId,
    blocks: Vec<RecordedBlock>,
    seen: FxHashSet<AppPc>,
    /// Block selected by dispatch, not yet executed.
    current: Option<(FragmentId, AppPc)>,
}

impl TraceRecorder {
    fn new(head: AppPc, head_id: FragmentId) -> Self {
        TraceRecorder {
            head,
            head_id,
            blocks: Vec::new(),
            seen: FxHashSet::default(),
            current: None,
        }
    }

    /// The head tag this recording started from.
    #[must_use]
    pub fn head(&self) -> AppPc {
        self.head
    }

    /// Blocks recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Drives trace-head promotion, recording, and emission.
#[derive(Debug)]
pub struct TraceManager {
    threshold: u32,
    max_blocks: usize,
}

impl TraceManager {
    /// A manager with the given hotness threshold and length cap.
    #[must_use]
    pub fn new(threshold: u32, max_blocks: usize) -> Self {
        TraceManager {
            threshold,
            max_blocks,
        }
    }

    /// Called by dispatch after fragment selection, before execution.
    pub fn at_dispatch(
        &self,
        d: &Dispatcher<'_>,
        tcx: &mut ThreadContext,
        id: FragmentId,
        frag: &Fragment,
    ) -> Result<TraceDirective> {
        if tcx.tracing.is_some() {
            if !self.traceable(frag) {
                // The path ran into something a trace may not span; emit
                // what we have (the previous block's exit already targets
                // this tag) and fall back to normal execution.
                self.finish(d, tcx, false)?;
                return Ok(TraceDirective::Normal);
            }
            if let Some(recorder) = tcx.tracing.as_mut() {
                recorder.current = Some((id, frag.tag()));
            }
            return Ok(TraceDirective::SingleStep);
        }

        if self.threshold == 0 || !self.traceable(frag) {
            return Ok(TraceDirective::Normal);
        }

        match frag.trace_state() {
            TraceState::Cold => {
                if frag.hit_count() >= self.threshold {
                    self.promote_to_head(d, id, frag);
                } else if frag.hit_count() > 0 {
                    frag.set_trace_state(TraceState::Warm);
                }
                Ok(TraceDirective::Normal)
            }
            TraceState::Warm => {
                if frag.hit_count() >= self.threshold {
                    self.promote_to_head(d, id, frag);
                }
                Ok(TraceDirective::Normal)
            }
            TraceState::Head => {
                if frag.try_trace_transition(TraceState::Head, TraceState::Tracing) {
                    let mut recorder = TraceRecorder::new(frag.tag(), id);
                    recorder.current = Some((id, frag.tag()));
                    tcx.tracing = Some(recorder);
                    tracing::debug!(head = %frag.tag(), "trace recording started");
                    Ok(TraceDirective::SingleStep)
                } else {
                    // Lost the promotion race; the other thread records.
                    Ok(TraceDirective::Normal)
                }
            }
            TraceState::Tracing | TraceState::Retired => Ok(TraceDirective::Normal),
        }
    }

    /// Called by dispatch after a single-stepped block finished.
    ///
    /// Updates the recorded path and either keeps recording, emits the
    /// trace, or (for exits a trace may not span) emits what was gathered.
    pub fn on_block_end(
        &self,
        d: &Dispatcher<'_>,
        tcx: &mut ThreadContext,
        exit: ExecExit,
    ) -> Result<()> {
        let (id, tag) = {
            let Some(recorder) = tcx.tracing.as_mut() else {
                return Err(corrupt_error!("block end without an active recorder"));
            };
            let Some(current) = recorder.current.take() else {
                return Err(corrupt_error!("block end without a current block"));
            };
            current
        };

        let (succ, stop): (Option<AppPc>, bool) = match exit {
            ExecExit::Stub { frag, exit } | ExecExit::Branched { frag, exit, .. } => {
                let target = d
                    .slab
                    .get(frag)
                    .and_then(|f| f.exit(exit).map(|e| e.target()));
                match target {
                    Some(ExitTarget::Direct(t)) => (Some(t), false),
                    _ => (None, true),
                }
            }
            ExecExit::IndirectHit { next, .. } => {
                let tag = d
                    .cache
                    .fragment_at(next)
                    .and_then(|fid| d.slab.get(fid))
                    .map(|f| f.tag());
                if let Some(t) = tag {
                    tcx.mc.pc = t.0;
                }
                (tag, true)
            }
            ExecExit::IndirectMiss { target } => (Some(target), true),
            ExecExit::Syscall { .. } => {
                // Traces never span a system call: emit without this block.
                return self.finish(d, tcx, false);
            }
            _ => (None, true),
        };

        let Some(succ) = succ else {
            self.abort_recording(tcx);
            return Ok(());
        };

        let (head, seen_succ, len) = {
            let recorder = tcx
                .tracing
                .as_mut()
                .ok_or_else(|| corrupt_error!("recorder vanished mid-block"))?;
            recorder.blocks.push(RecordedBlock { tag, id, succ });
            recorder.seen.insert(tag);
            (
                recorder.head,
                recorder.seen.contains(&succ),
                recorder.blocks.len(),
            )
        };
        if let ExecExit::Branched { .. } | ExecExit::Stub { .. } = exit {
            tcx.mc.pc = succ.0;
        }

        if stop {
            return self.finish(d, tcx, false);
        }
        if succ == head {
            return self.finish(d, tcx, true);
        }
        if seen_succ || len >= self.max_blocks {
            return self.finish(d, tcx, false);
        }
        Ok(())
    }

    /// Discards an in-progress recording (fault, flush of a constituent).
    pub fn abort_recording(&self, tcx: &mut ThreadContext) {
        if let Some(recorder) = tcx.tracing.take() {
            tracing::debug!(head = %recorder.head, "trace recording discarded");
        }
    }

    /// Whether a fragment may participate in a trace. Private blocks are
    /// excluded: traces live in the shared partition, which the private
    /// table would shadow at lookup.
    fn traceable(&self, frag: &Fragment) -> bool {
        frag.partition() != Partition::Private
            && !frag.flags().intersects(
                FragmentFlags::IS_TRACE
                    | FragmentFlags::CANNOT_LINK
                    | FragmentFlags::SYNTH_FAULT
                    | FragmentFlags::FROZEN
                    | FragmentFlags::BEING_FLUSHED,
            )
    }

    fn promote_to_head(&self, d: &Dispatcher<'_>, id: FragmentId, frag: &Fragment) {
        frag.set_trace_state(TraceState::Head);
        // Entries must funnel through dispatch so the counter sees them.
        frag.set_flags(FragmentFlags::CANNOT_LINK);
        d.linker.unlink_incoming(id);
        d.ibl.remove(frag.tag());
        tracing::debug!(tag = %frag.tag(), hits = frag.hit_count(), "promoted to trace head");
    }

    /// Emits the recorded path as a trace fragment (or resets the head when
    /// the recording is not emittable).
    fn finish(&self, d: &Dispatcher<'_>, tcx: &mut ThreadContext, looped: bool) -> Result<()> {
        let Some(recorder) = tcx.tracing.take() else {
            return Ok(());
        };
        let head_id = recorder.head_id;
        let head_tag = recorder.head;

        let reset_head = |state: TraceState| {
            if let Some(head) = d.slab.get(head_id) {
                head.set_trace_state(state);
            }
        };

        if recorder.blocks.is_empty() {
            reset_head(TraceState::Head);
            return Ok(());
        }
        // A flushed constituent invalidates the recording.
        for block in &recorder.blocks {
            let live = d
                .slab
                .get(block.id)
                .is_some_and(|f| !f.flags().contains(FragmentFlags::BEING_FLUSHED));
            if !live {
                tracing::debug!(head = %head_tag, "constituent flushed, trace discarded");
                reset_head(TraceState::Head);
                return Ok(());
            }
        }

        match self.emit(d, tcx, &recorder) {
            Ok(trace_id) => {
                reset_head(TraceState::Retired);
                tracing::info!(
                    head = %head_tag,
                    blocks = recorder.blocks.len(),
                    looped,
                    %trace_id,
                    "trace emitted"
                );
                Ok(())
            }
            Err(Error::OutOfCache) => {
                reset_head(TraceState::Head);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-decodes and fuses the recorded blocks into one trace body.
    fn emit(
        &self,
        d: &Dispatcher<'_>,
        tcx: &mut ThreadContext,
        recorder: &TraceRecorder,
    ) -> Result<FragmentId> {
        let mut emit = Emitter::new(d.isa, tcx.arena.lease(1024));
        emit.flags |= FragmentFlags::IS_TRACE | FragmentFlags::SHARED;

        let mut fetch = vec![0u8; d.isa.max_instr_len()];
        let last = recorder.blocks.len() - 1;

        for (i, block) in recorder.blocks.iter().enumerate() {
            let mut pc = block.tag;
            loop {
                let got = match d.os.read_app(pc.0, &mut fetch) {
                    Ok(got) if got > 0 => got,
                    _ => return Err(corrupt_error!("traced block at {pc} became unreadable")),
                };
                let instr = d
                    .isa
                    .decode(&fetch[..got], pc)
                    .map_err(|_| corrupt_error!("traced block at {pc} became undecodable"))?;

                if !instr.flow.ends_block() {
                    emit.app_instr(&instr)?;
                    pc = instr.next_pc();
                    continue;
                }

                let is_last = i == last;
                match instr.flow {
                    ControlKind::DirectJump { target } => {
                        if is_last {
                            // Loop back to the head (the trace's own entry
                            // once linked) or plain exit.
                            emit.direct_exit(target, target);
                        }
                        // Mid-trace: elided, the next block follows inline.
                    }
                    ControlKind::CondJump { taken, fall } => {
                        let recorded_taken = block.succ == taken;
                        let off_trace = if recorded_taken { fall } else { taken };
                        emit.guard_exit(&instr, off_trace, recorded_taken)?;
                        if is_last {
                            emit.direct_exit(block.succ, block.succ);
                        }
                    }
                    ControlKind::DirectCall { ret, .. } => {
                        if is_last {
                            emit.terminator(&instr)?;
                        } else {
                            emit.inline_call(&instr, ret);
                        }
                    }
                    _ => {
                        // Returns, indirects, syscalls only terminate the
                        // final block; the recorder stops at them.
                        if !is_last {
                            return Err(corrupt_error!(
                                "unspannable terminator mid-trace at {pc}"
                            ));
                        }
                        emit.terminator(&instr)?;
                    }
                }
                break;
            }
        }

        let body_len = emit.code.len() as u32;
        emit.xl8.seal(body_len);

        let slot = match d.cache.place(Partition::Trace, None, &emit.code) {
            Ok(slot) => slot,
            Err(Error::OutOfCache) => {
                d.evict_oldest(Some(tcx), Partition::Trace)?;
                d.cache.place(Partition::Trace, None, &emit.code)?
            }
            Err(e) => return Err(e),
        };

        let app_len = d
            .slab
            .get(recorder.head_id)
            .map_or(0, |head| head.app_len());
        let frag = Fragment::new(
            recorder.head,
            app_len,
            Partition::Trace,
            None,
            slot,
            emit.flags,
            emit.exits,
            emit.xl8,
        );
        tcx.arena.recycle(emit.code);

        let trace_id = d.slab.insert(frag);
        d.cache.register_fragment(slot, trace_id);

        // The trace shadows the head in the shared table.
        d.shared_table.remove_match(recorder.head, recorder.head_id);
        match d.shared_table.insert(recorder.head, trace_id) {
            InsertOutcome::Inserted => Ok(trace_id),
            InsertOutcome::AlreadyPresent(_) => {
                // Another trace won the shadow race; drop ours.
                d.cache.unregister_fragment(slot, trace_id);
                d.slab.remove(trace_id);
                Err(Error::OutOfCache)
            }
        }
    }
}
