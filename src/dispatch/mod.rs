//! The dispatch loop: engine-side control between fragment executions.
//!
//! Dispatch is where a thread lives whenever it is not inside the cache.
//! Each iteration: pass the safe point (park for a synchronizer, honor a
//! detach), sweep the wrap stack for abnormally unwound frames, drain
//! pending asynchronous events, run wrap entry/post-call hooks for the
//! current tag, look up or build the fragment, give the trace machinery its
//! turn, then context-switch into the cache and interpret the exit that
//! comes back.
//!
//! Dispatch is reentrant with respect to signals (a nested callback frame
//! re-enters it) but never recursively on the same thread's engine stack;
//! [`ThreadContext::in_dispatch`] guards that discipline.

mod executor;

pub use executor::{CacheExecutor, ExecEnv, ExecExit};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    arch::{AppPc, Isa},
    cache::{CodeCache, Partition},
    config::EngineOptions,
    fragment::{
        BuildSpec, Fragment, FragmentBuilder, FragmentFlags, FragmentId, FragmentSlab,
    },
    ibl::IblTable,
    interpose::{FaultDisposition, Interposer},
    link::Linker,
    os::{ExceptionRecord, OsFacade, SyscallOutcome},
    persist::FrozenRegistry,
    synch::Synchall,
    table::{InsertOutcome, SharedTable},
    thread::{RunState, ThreadContext},
    trace::{TraceDirective, TraceManager},
    wrap::{WrapDisposition, WrapManager},
    Error, Result,
};

/// How a shepherded thread left its dispatch loop.
#[derive(Clone, Debug)]
pub enum ThreadOutcome {
    /// The application thread exited (thread- or process-exit syscall).
    Exited,
    /// Detach completed; the context is ready for native continuation.
    Detached(crate::arch::Mcontext),
    /// An application fault had no handler; natively the process would die
    /// with this record.
    Faulted(ExceptionRecord),
}

/// One thread's view of the engine while it runs the dispatch loop.
///
/// Borrowed wholesale from the engine handle; nothing here is owned.
pub struct Dispatcher<'e> {
    /// Machine-code backend.
    pub isa: &'e dyn Isa,
    /// Host facade.
    pub os: &'e dyn OsFacade,
    /// Cache memory.
    pub cache: &'e CodeCache,
    /// Fragment records.
    pub slab: &'e FragmentSlab,
    /// Process-shared fragment table.
    pub shared_table: &'e SharedTable,
    /// Indirect-branch lookup table.
    pub ibl: &'e IblTable,
    /// Exit patching.
    pub linker: &'e Linker,
    /// Cache entry/exit backend.
    pub executor: &'e dyn CacheExecutor,
    /// Wrap/replace layer.
    pub wrap: &'e WrapManager,
    /// Async-event interposer.
    pub interpose: &'e Interposer,
    /// Trace builder.
    pub trace: &'e TraceManager,
    /// Safe-point protocol.
    pub synch: &'e Synchall,
    /// Frozen module caches.
    pub frozen: &'e FrozenRegistry,
    /// Engine options.
    pub options: &'e EngineOptions,
    /// Process-wide detach flag.
    pub detaching: &'e AtomicBool,
}

impl Dispatcher<'_> {
    /// Runs the thread's dispatch loop to completion.
    ///
    /// # Errors
    ///
    /// Engine-internal corruption only; application-visible terminations are
    /// [`ThreadOutcome`]s.
    pub fn run(&self, tcx: &mut ThreadContext) -> Result<ThreadOutcome> {
        if tcx.in_dispatch {
            return Err(corrupt_error!(
                "dispatch reentered on thread {}",
                tcx.tid()
            ));
        }
        tcx.in_dispatch = true;
        let result = self.run_inner(tcx);
        tcx.in_dispatch = false;
        result
    }

    fn run_inner(&self, tcx: &mut ThreadContext) -> Result<ThreadOutcome> {
        tcx.shared.set_state(RunState::InEngine);
        // Tag to publish into the indirect lookup once resolved.
        let mut fill_ibl: Option<AppPc> = None;

        loop {
            // Safe point: every cache exit funnels through here.
            tcx.shared.interrupt.store(false, Ordering::Release);
            if tcx.shared.synch_requested() {
                tcx.shared.park_at_safe_point();
            }
            if self.detaching.load(Ordering::Acquire) {
                return Ok(self.detach_thread(tcx));
            }

            if self.interpose.drain_pending(tcx, self.os)? {
                // Redirected into a handler; start over at its first block.
                continue;
            }

            // Post-call handling, the abnormal-unwind watermark sweep, and
            // wrapped-entry callbacks, in that order.
            match self.wrap.at_dispatch(self, tcx)? {
                WrapDisposition::Redirect => continue,
                WrapDisposition::Continue => {}
            }

            let tag = tcx.mc.app_pc();
            let (id, frag) = self.lookup_or_build(tcx, tag)?;

            if let Some(pending) = fill_ibl.take() {
                if pending == tag && !frag.flags().contains(FragmentFlags::CANNOT_LINK) {
                    self.ibl.insert(tag, frag.entry());
                }
            }

            let directive = self.trace.at_dispatch(self, tcx, id, &frag)?;

            frag.record_hit();
            tcx.shared.set_state(RunState::InCache);
            let exit = {
                let mut env = ExecEnv {
                    cache: self.cache,
                    slab: self.slab,
                    ibl: self.ibl,
                    os: self.os,
                    interrupt: &tcx.shared.interrupt,
                    spills: &tcx.shared.spills,
                    follow_links: directive == TraceDirective::Normal,
                };
                self.executor.enter(&mut env, &mut tcx.mc, frag.entry(), id)?
            };
            tcx.shared.set_state(RunState::InEngine);

            match exit {
                ExecExit::Stub { frag: src, exit } => {
                    let target = self.resolve_stub(tcx, src, exit, directive)?;
                    tcx.mc.pc = target.0;
                }
                ExecExit::IndirectMiss { target } => {
                    fill_ibl = Some(target);
                    if directive == TraceDirective::SingleStep {
                        self.trace.on_block_end(self, tcx, exit)?;
                    }
                    tcx.mc.pc = target.0;
                }
                ExecExit::Syscall {
                    frag: src,
                    exit: exit_idx,
                } => {
                    if directive == TraceDirective::SingleStep {
                        self.trace.on_block_end(self, tcx, exit)?;
                    }
                    match self.perform_syscall(tcx, src, exit_idx)? {
                        Some(next) => tcx.mc.pc = next.0,
                        None => return Ok(ThreadOutcome::Exited),
                    }
                }
                ExecExit::Fault {
                    frag: src,
                    cache_pc,
                    kind,
                } => {
                    if directive == TraceDirective::SingleStep {
                        self.trace.abort_recording(tcx);
                    }
                    let src_frag = self
                        .slab
                        .get(src)
                        .ok_or_else(|| corrupt_error!("fault in unknown fragment {src}"))?;
                    match self
                        .interpose
                        .on_cache_fault(tcx, &src_frag, cache_pc, kind, self.os)?
                    {
                        FaultDisposition::Redirected => {}
                        FaultDisposition::Unhandled(record) => {
                            return Ok(ThreadOutcome::Faulted(record))
                        }
                    }
                }
                ExecExit::Interrupted { frag: src, cache_pc } => {
                    // Teleport back to application state so the next safe
                    // point is fully translatable.
                    let src_frag = self
                        .slab
                        .get(src)
                        .ok_or_else(|| corrupt_error!("interrupt in unknown fragment {src}"))?;
                    let off = src_frag
                        .body_offset(cache_pc)
                        .ok_or(Error::NotInCache(cache_pc))?;
                    let spills = *lock!(tcx.shared.spills);
                    tcx.mc = src_frag
                        .translations()
                        .translate(off, cache_pc, &tcx.mc, &spills)?;
                }
                ExecExit::Branched { .. } | ExecExit::IndirectHit { .. } => {
                    self.trace.on_block_end(self, tcx, exit)?;
                }
            }
        }
    }

    /// Looks up a fragment for `tag` (private, then shared, then frozen),
    /// building one when absent.
    pub(crate) fn lookup_or_build(
        &self,
        tcx: &mut ThreadContext,
        tag: AppPc,
    ) -> Result<(FragmentId, Arc<Fragment>)> {
        if let Some(id) = tcx.table.lookup(tag) {
            if let Some(frag) = self.slab.get(id) {
                return Ok((id, frag));
            }
            // Stale private entry (fragment evicted); drop it.
            tcx.table.remove(tag);
        }
        if let Some(id) = self.shared_table.lookup(tag) {
            if let Some(frag) = self.slab.get(id) {
                if !frag.flags().contains(FragmentFlags::BEING_FLUSHED) {
                    return Ok((id, frag));
                }
            }
        }
        if let Some(id) = self.frozen.lookup(tag) {
            if let Some(frag) = self.slab.get(id) {
                return Ok((id, frag));
            }
        }
        self.build_block(tcx, tag)
    }

    /// Builds, places, and registers a new basic block for `tag`.
    fn build_block(
        &self,
        tcx: &mut ThreadContext,
        tag: AppPc,
    ) -> Result<(FragmentId, Arc<Fragment>)> {
        let private = self.options.private_blocks;
        let partition = if private {
            Partition::Private
        } else {
            Partition::Shared
        };
        let owner = private.then(|| tcx.tid());

        let mut spec = BuildSpec::at(tag, partition, owner);
        spec.max_instrs = self.options.max_block_instrs;
        spec.cannot_link = self.wrap.entry_needs_dispatch(tag);
        if let Some(replacement) = self.wrap.replacement_for(tag) {
            spec.decode_at = replacement;
        }

        let builder = FragmentBuilder::new(self.isa, self.os);
        let built = builder.build(&spec, &mut tcx.arena)?;

        // FIFO-with-watermark: reclaim the oldest unit once live bytes cross
        // the high watermark, before placement needs the space.
        if self.cache.needs_eviction(partition) {
            self.evict_oldest(Some(tcx), partition)?;
        }

        // Out-of-cache triggers one round of eviction, then a retry.
        let slot = match self.cache.place(partition, owner, &built.code) {
            Ok(slot) => slot,
            Err(Error::OutOfCache) => {
                self.evict_oldest(Some(tcx), partition)?;
                self.cache.place(partition, owner, &built.code)?
            }
            Err(e) => return Err(e),
        };

        let mut flags = built.flags;
        if !private {
            flags |= FragmentFlags::SHARED;
        }
        let frag = Fragment::new(
            tag,
            built.app_len,
            partition,
            owner,
            slot,
            flags,
            built.exits,
            built.xl8,
        );
        tcx.arena.recycle(built.code);

        let id = self.slab.insert(frag);
        self.cache.register_fragment(slot, id);

        loop {
            let outcome = if private {
                tcx.table.insert(tag, id)
            } else {
                self.shared_table.insert(tag, id)
            };
            match outcome {
                InsertOutcome::Inserted => {
                    tracing::debug!(%tag, %id, %partition, "built fragment");
                    let frag = self
                        .slab
                        .get(id)
                        .ok_or_else(|| corrupt_error!("fresh fragment {id} vanished"))?;
                    return Ok((id, frag));
                }
                InsertOutcome::AlreadyPresent(existing) => {
                    if let Some(frag) = self.slab.get(existing) {
                        // Lost the race to another thread: free our build
                        // and use the winner's fragment.
                        self.cache.unregister_fragment(slot, id);
                        self.slab.remove(id);
                        tracing::trace!(%tag, "lost shared build race");
                        return Ok((existing, frag));
                    }
                    // Stale entry left behind by an eviction in flight:
                    // clear it and insert ours.
                    if private {
                        tcx.table.remove(tag);
                    } else {
                        self.shared_table.remove_match(tag, existing);
                    }
                }
            }
        }
    }

    /// Resolves an unlinked direct exit: find (or build) the target and, when
    /// allowed, patch the exit so the next execution stays in-cache.
    fn resolve_stub(
        &self,
        tcx: &mut ThreadContext,
        src: FragmentId,
        exit: u32,
        directive: TraceDirective,
    ) -> Result<AppPc> {
        let src_frag = self
            .slab
            .get(src)
            .ok_or_else(|| corrupt_error!("stub exit from unknown fragment {src}"))?;
        let Some(exit_ref) = src_frag.exit(exit) else {
            return Err(corrupt_error!("fragment {src} has no exit {exit}"));
        };
        let target = match exit_ref.target() {
            crate::fragment::ExitTarget::Direct(t) => t,
            other => {
                return Err(corrupt_error!(
                    "stub exit {exit} of {src} is not direct: {other:?}"
                ))
            }
        };

        if directive == TraceDirective::SingleStep {
            self.trace
                .on_block_end(self, tcx, ExecExit::Stub { frag: src, exit })?;
            return Ok(target);
        }

        // Link for next time when the target already exists. Backward edges
        // into basic blocks stay unlinked while tracing is on: loop heads
        // must keep funnelling through dispatch so their counters see every
        // entry, until a trace retires them.
        if let Some(target_id) = self.peek_fragment(tcx, target) {
            let countable = self.options.trace_threshold > 0
                && target.0 <= src_frag.tag().0
                && self.slab.get(target_id).is_some_and(|f| {
                    !f.flags().contains(FragmentFlags::IS_TRACE)
                        && f.trace_state() != crate::fragment::TraceState::Retired
                });
            if !countable {
                self.linker.link(src, exit, target_id);
            }
        }
        Ok(target)
    }

    /// Non-building lookup across the partitions.
    fn peek_fragment(&self, tcx: &ThreadContext, tag: AppPc) -> Option<FragmentId> {
        tcx.table
            .lookup(tag)
            .or_else(|| self.shared_table.lookup(tag))
            .filter(|id| self.slab.get(*id).is_some())
    }

    fn perform_syscall(
        &self,
        tcx: &mut ThreadContext,
        src: FragmentId,
        exit: u32,
    ) -> Result<Option<AppPc>> {
        let src_frag = self
            .slab
            .get(src)
            .ok_or_else(|| corrupt_error!("syscall exit from unknown fragment {src}"))?;
        let target = src_frag
            .exit(exit)
            .map(|e| e.target())
            .ok_or_else(|| corrupt_error!("fragment {src} has no exit {exit}"))?;
        let crate::fragment::ExitTarget::Syscall { next, vector } = target else {
            return Err(corrupt_error!("exit {exit} of {src} is not a syscall exit"));
        };

        // While in the kernel the thread counts as parked: synchall never
        // waits on a blocked system call.
        tcx.shared.set_state(RunState::InKernel);
        let outcome = self.os.syscall(&mut tcx.mc);
        tcx.shared.set_state(RunState::InEngine);

        match outcome? {
            SyscallOutcome::Continue => {
                if let Some(vector) = vector {
                    tracing::trace!(vector, "software interrupt completed");
                }
                Ok(Some(next))
            }
            SyscallOutcome::ExitThread | SyscallOutcome::ExitProcess => Ok(None),
        }
    }

    /// Detach: drain wrap frames with the abnormal flag, then hand back a
    /// native continuation context.
    fn detach_thread(&self, tcx: &mut ThreadContext) -> ThreadOutcome {
        self.wrap.drain_for_detach(tcx, self.os);
        tcx.shared.set_state(RunState::Exited);
        tracing::info!(tid = %tcx.tid(), "thread detached");
        ThreadOutcome::Detached(tcx.mc.clone())
    }

    /// Reclaims the oldest unit of `partition`.
    ///
    /// `tcx` is the calling thread's context when the caller is a shepherded
    /// thread (required for the private partition, whose tables only the
    /// owner may touch).
    ///
    /// # Errors
    ///
    /// Propagates release failures; an empty partition is not an error.
    pub(crate) fn evict_oldest(
        &self,
        tcx: Option<&mut ThreadContext>,
        partition: Partition,
    ) -> Result<()> {
        let owner = match (&tcx, partition) {
            (Some(tcx), Partition::Private) => Some(tcx.tid()),
            _ => None,
        };
        let Some(unit) = self.cache.retire_oldest(partition, owner) else {
            return Ok(());
        };
        self.reclaim_unit(tcx, unit)
    }

    /// The full unit-reclaim protocol: unlink every fragment, pull it from
    /// its table, drop its lookup entries, synch every thread through a safe
    /// point, then release the pages.
    pub(crate) fn reclaim_unit(
        &self,
        mut tcx: Option<&mut ThreadContext>,
        unit: crate::cache::UnitId,
    ) -> Result<()> {
        let ids = self.cache.fragments_in(unit);
        tracing::debug!(unit = ?unit, fragments = ids.len(), "reclaiming cache unit");

        for &id in &ids {
            let Some(frag) = self.slab.get(id) else {
                continue;
            };
            frag.set_flags(FragmentFlags::BEING_FLUSHED);
            self.linker.unlink_incoming(id);
            self.linker.unlink_outgoing(id, &frag);
            if frag.flags().contains(FragmentFlags::SHARED) {
                self.shared_table.remove_match(frag.tag(), id);
            } else if let Some(tcx) = tcx.as_deref_mut() {
                tcx.table.remove(frag.tag());
            }
            self.ibl.remove(frag.tag());
        }

        // Grace period: no thread may still hold a cache PC inside the unit.
        let own = tcx.as_deref().map(|t| t.shared.clone());
        self.synch
            .barrier(own.as_deref(), self.os, self.cache, self.slab, || {})?;

        for &id in &ids {
            if let Some(frag) = self.slab.get(id) {
                self.cache.unregister_fragment(frag.slot(), id);
            }
            self.slab.remove(id);
        }
        self.cache.release_unit(unit)
    }

    /// Flushes the fragment(s) registered for `tag` out of the shared table
    /// and cache. Returns once every other thread has been observed outside
    /// the flushed code.
    ///
    /// # Errors
    ///
    /// Propagates synchall failure.
    pub fn flush_tag(&self, own: Option<&crate::thread::ThreadShared>, tag: AppPc) -> Result<bool> {
        let Some(id) = self.shared_table.lookup(tag) else {
            return Ok(false);
        };
        let Some(frag) = self.slab.get(id) else {
            return Ok(false);
        };

        frag.set_flags(FragmentFlags::BEING_FLUSHED);
        self.linker.unlink_incoming(id);
        self.linker.unlink_outgoing(id, &frag);
        self.shared_table.remove_match(tag, id);
        self.ibl.remove(tag);

        self.synch
            .barrier(own, self.os, self.cache, self.slab, || {})?;

        self.cache.unregister_fragment(frag.slot(), id);
        self.slab.remove(id);
        tracing::debug!(%tag, %id, "flushed fragment");
        Ok(true)
    }
}
