//! The async interposer: signals, exceptions, and callbacks.
//!
//! The engine owns the top-level handler for every asynchronous event in the
//! process. On delivery the interrupted PC is classified three ways:
//!
//! - **Application code** (never cached): the event propagates to the
//!   application's own handler with the original context.
//! - **Cache fragment**: the context is translated back to application state
//!   first, then the event is either delivered immediately (synchronous,
//!   fault-like) or queued on the owning thread and drained at its next
//!   dispatch safe point (asynchronous).
//! - **Engine code**: either an expected fault from a guarded probe (a
//!   [`TryFrames`] frame catches it) or an engine bug, which is fatal.
//!
//! Delivery itself is modeled the way the hardware would: the interrupted
//! application PC is pushed on the application stack, the event code and
//! data address land in the argument registers, and control resumes at the
//! application's registered handler; the handler's return resumes the
//! interrupted instruction.
//!
//! Kernel-initiated callbacks (Windows-family) route through
//! [`Interposer::callback_enter`]/[`Interposer::callback_return`], which
//! nest and unwind whole dispatch contexts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::{
    arch::{AppPc, CachePc, FaultKind, STACK_SLOT},
    cache::CodeCache,
    fragment::{Fragment, FragmentSlab},
    os::{ExceptionRecord, OsFacade},
    thread::{ThreadContext, ThreadRegistry},
    Result,
};

/// Event code the engine reports for an invalid instruction.
pub const EV_ILL: u32 = 4;
/// Event code the engine reports for an access violation.
pub const EV_SEGV: u32 = 11;

/// Classification of an interrupted PC.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PcSite {
    /// Original application text.
    App,
    /// Inside a live cache fragment.
    Cache(crate::fragment::FragmentId),
    /// Neither: engine code.
    Engine,
}

/// What became of a fault the interposer was handed.
#[derive(Clone, Debug)]
pub enum FaultDisposition {
    /// The context was redirected into an application handler.
    Redirected,
    /// No handler: natively the process dies with this record.
    Unhandled(ExceptionRecord),
}

/// Per-thread queue of deferred asynchronous events.
///
/// Pushed by any thread (under the queue lock, lowest in the lock rank);
/// drained only by the owning thread at dispatch, or inspected by a
/// synchronizer holding the owner suspended.
#[derive(Debug, Default)]
pub struct PendingQueue {
    inner: Mutex<VecDeque<ExceptionRecord>>,
}

impl PendingQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        PendingQueue::default()
    }

    /// Appends an event.
    pub fn push(&self, record: ExceptionRecord) {
        lock!(self.inner).push_back(record);
    }

    /// Removes the oldest event.
    #[must_use]
    pub fn pop(&self) -> Option<ExceptionRecord> {
        lock!(self.inner).pop_front()
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        lock!(self.inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock!(self.inner).is_empty()
    }
}

/// Stack of active guarded-probe frames.
///
/// Engine code that dereferences application memory on purpose (wrap-layer
/// argument reads, return-address probes) brackets the access in a frame;
/// a fault arriving while a frame is active is expected and caught rather
/// than fatal.
#[derive(Debug, Default)]
pub struct TryFrames {
    labels: Vec<&'static str>,
}

impl TryFrames {
    /// No active frames.
    #[must_use]
    pub fn new() -> Self {
        TryFrames::default()
    }

    /// Opens a guarded region.
    pub fn enter(&mut self, label: &'static str) {
        self.labels.push(label);
    }

    /// Closes the innermost guarded region.
    pub fn exit(&mut self) {
        self.labels.pop();
    }

    /// Whether a guarded region is active.
    #[must_use]
    pub fn active(&self) -> bool {
        !self.labels.is_empty()
    }
}

type NotifyFn = Arc<dyn Fn(AppPc) + Send + Sync>;

/// The asynchronous-event redirection subsystem.
pub struct Interposer {
    cache: Arc<CodeCache>,
    slab: Arc<FragmentSlab>,
    registry: Arc<ThreadRegistry>,
    /// Application-registered handlers by event code.
    handlers: DashMap<u32, AppPc>,
}

impl Interposer {
    /// An interposer over the engine's cache, slab, and thread registry.
    #[must_use]
    pub fn new(
        cache: Arc<CodeCache>,
        slab: Arc<FragmentSlab>,
        registry: Arc<ThreadRegistry>,
    ) -> Self {
        Interposer {
            cache,
            slab,
            registry,
            handlers: DashMap::new(),
        }
    }

    /// Registers (or, with `None`, removes) the application's handler for an
    /// event code. In a full deployment this is fed by interposing on the
    /// application's handler-registration syscalls.
    pub fn set_app_handler(&self, code: u32, handler: Option<AppPc>) {
        match handler {
            Some(pc) => {
                self.handlers.insert(code, pc);
            }
            None => {
                self.handlers.remove(&code);
            }
        }
    }

    /// The application's registered handler for `code`.
    #[must_use]
    pub fn app_handler(&self, code: u32) -> Option<AppPc> {
        self.handlers.get(&code).map(|h| *h)
    }

    /// Classifies an interrupted PC: cache fragment, mapped application
    /// code, or (neither) engine code.
    #[must_use]
    pub fn classify(&self, pc: u64, os: &dyn OsFacade) -> PcSite {
        if let Some(frag) = self.cache.fragment_at(CachePc(pc)) {
            PcSite::Cache(frag)
        } else if os.query(pc).is_some() {
            PcSite::App
        } else {
            PcSite::Engine
        }
    }

    /// Queues an asynchronous event for `tid` and kicks the thread out of
    /// the cache so its dispatch loop drains the queue promptly.
    pub fn post(&self, tid: crate::os::ThreadId, record: ExceptionRecord) {
        for shared in self.registry.all() {
            if shared.tid() == tid {
                shared.pending.push(record);
                shared
                    .interrupt
                    .store(true, std::sync::atomic::Ordering::Release);
                tracing::debug!(%tid, "queued async event");
                return;
            }
        }
        tracing::warn!(%tid, "async event for unknown thread dropped");
    }

    /// Drains one pending event at a dispatch safe point.
    ///
    /// Returns `true` when the context was redirected into a handler (the
    /// caller restarts its loop); `false` when nothing was pending.
    ///
    /// # Errors
    ///
    /// Propagates stack-write failures during frame construction.
    pub fn drain_pending(&self, tcx: &mut ThreadContext, os: &dyn OsFacade) -> Result<bool> {
        let Some(record) = tcx.shared.pending.pop() else {
            return Ok(false);
        };
        let Some(handler) = self.app_handler(record.code) else {
            // Native default dispositions are out of scope; an unhandled
            // asynchronous event is dropped with a record.
            tracing::warn!(code = record.code, "no handler for deferred event, dropped");
            return Ok(false);
        };
        self.redirect_to_handler(tcx, os, &record, handler)?;
        Ok(true)
    }

    /// Handles a synchronous fault raised while executing inside a cache
    /// fragment. Translates the context, then delivers or reports.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Untranslatable`] when the faulting cache PC has no
    /// restartable boundary (a bug state), or stack-write failures during
    /// delivery.
    pub fn on_cache_fault(
        &self,
        tcx: &mut ThreadContext,
        frag: &Fragment,
        cache_pc: CachePc,
        kind: FaultKind,
        os: &dyn OsFacade,
    ) -> Result<FaultDisposition> {
        let off = frag
            .body_offset(cache_pc)
            .ok_or(crate::Error::NotInCache(cache_pc))?;
        let spills = *lock!(tcx.shared.spills);
        tcx.mc = frag
            .translations()
            .translate(off, cache_pc, &tcx.mc, &spills)?;

        let (code, addr) = match kind {
            FaultKind::InvalidOpcode => (EV_ILL, None),
            FaultKind::ReadFault(a) | FaultKind::WriteFault(a) | FaultKind::ExecFault(a) => {
                (EV_SEGV, Some(a))
            }
        };
        let record = ExceptionRecord {
            code,
            pc: tcx.mc.pc,
            addr,
            synchronous: true,
        };

        match self.app_handler(code) {
            Some(handler) => {
                self.redirect_to_handler(tcx, os, &record, handler)?;
                Ok(FaultDisposition::Redirected)
            }
            None => {
                tracing::debug!(code, pc = record.pc, "unhandled application fault");
                Ok(FaultDisposition::Unhandled(record))
            }
        }
    }

    /// Handles a host-reported event for the current thread (the installed
    /// exception hook's entry point).
    ///
    /// # Errors
    ///
    /// [`crate::Error::Corrupt`] for a fault in engine code with no guarded
    /// frame active.
    pub fn on_host_event(
        &self,
        tcx: &mut ThreadContext,
        record: &ExceptionRecord,
        os: &dyn OsFacade,
    ) -> Result<FaultDisposition> {
        match self.classify(record.pc, os) {
            PcSite::App => match self.app_handler(record.code) {
                Some(handler) => {
                    self.redirect_to_handler(tcx, os, record, handler)?;
                    Ok(FaultDisposition::Redirected)
                }
                None => Ok(FaultDisposition::Unhandled(record.clone())),
            },
            PcSite::Cache(id) => {
                let frag = self
                    .slab
                    .get(id)
                    .ok_or_else(|| corrupt_error!("event in vanished fragment {id}"))?;
                if record.synchronous {
                    let kind = match record.code {
                        EV_ILL => FaultKind::InvalidOpcode,
                        _ => FaultKind::ReadFault(record.addr.unwrap_or(0)),
                    };
                    self.on_cache_fault(tcx, &frag, CachePc(record.pc), kind, os)
                } else {
                    // Deferred: translated state is rebuilt at the next safe
                    // point; only the event itself is queued.
                    tcx.shared.pending.push(record.clone());
                    Ok(FaultDisposition::Redirected)
                }
            }
            PcSite::Engine => {
                if tcx.try_frames.active() {
                    // Expected probe fault; the guarded caller sees the error
                    // through its own Result path.
                    Ok(FaultDisposition::Redirected)
                } else {
                    Err(corrupt_error!(
                        "fault {:#x} at engine pc {:#x}",
                        record.code,
                        record.pc
                    ))
                }
            }
        }
    }

    /// Enters a nested dispatch frame for a kernel-initiated callback: the
    /// current application context is saved and control restarts at
    /// `target`.
    pub fn callback_enter(&self, tcx: &mut ThreadContext, target: AppPc) {
        tcx.callback_frames.push(tcx.mc.clone());
        tcx.mc.pc = target.0;
        tracing::debug!(depth = tcx.callback_frames.len(), %target, "callback frame entered");
    }

    /// Unwinds the matching callback frame, restoring the interrupted
    /// context.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Corrupt`] when no frame is active.
    pub fn callback_return(&self, tcx: &mut ThreadContext) -> Result<()> {
        let saved = tcx
            .callback_frames
            .pop()
            .ok_or_else(|| corrupt_error!("callback return with no active frame"))?;
        tcx.mc = saved;
        Ok(())
    }

    /// Builds the delivery frame: interrupted PC on the application stack,
    /// event code and address in the argument registers, control at the
    /// handler.
    fn redirect_to_handler(
        &self,
        tcx: &mut ThreadContext,
        os: &dyn OsFacade,
        record: &ExceptionRecord,
        handler: AppPc,
    ) -> Result<()> {
        let resume = tcx.mc.pc;
        tcx.mc.sp = tcx.mc.sp.wrapping_sub(STACK_SLOT);
        os.write_app(tcx.mc.sp, &resume.to_le_bytes())?;
        tcx.mc.set_reg(crate::arch::ARG_REGS[0], u64::from(record.code));
        tcx.mc
            .set_reg(crate::arch::ARG_REGS[1], record.addr.unwrap_or(0));
        tcx.mc.pc = handler.0;
        tracing::debug!(code = record.code, %handler, "redirected into application handler");
        Ok(())
    }
}

impl std::fmt::Debug for Interposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interposer")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_queue_fifo() {
        let queue = PendingQueue::new();
        queue.push(ExceptionRecord {
            code: 1,
            pc: 0,
            addr: None,
            synchronous: false,
        });
        queue.push(ExceptionRecord {
            code: 2,
            pc: 0,
            addr: None,
            synchronous: false,
        });
        assert_eq!(queue.pop().unwrap().code, 1);
        assert_eq!(queue.pop().unwrap().code, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_try_frames_nesting() {
        let mut frames = TryFrames::new();
        assert!(!frames.active());
        frames.enter("read-retaddr");
        frames.enter("read-arg");
        assert!(frames.active());
        frames.exit();
        assert!(frames.active());
        frames.exit();
        assert!(!frames.active());
    }

    #[test]
    fn test_callback_frames_nest_and_unwind() {
        use crate::{
            arch::{AppPc, Mcontext},
            cache::{CacheLimits, CodeCache},
            os::ThreadId,
            thread::{ThreadContext, ThreadRegistry},
            toy::ToyOs,
        };
        use std::sync::Arc;

        let os = Arc::new(ToyOs::new());
        let interposer = Interposer::new(
            Arc::new(CodeCache::new(os, CacheLimits::default())),
            Arc::new(crate::fragment::FragmentSlab::new()),
            Arc::new(ThreadRegistry::new()),
        );

        let mut tcx = ThreadContext::new(ThreadId(1), Mcontext::at(AppPc(0x1000), 0x8000));
        tcx.mc.set_reg(crate::arch::Reg(3), 77);

        interposer.callback_enter(&mut tcx, AppPc(0x5000));
        assert_eq!(tcx.mc.pc, 0x5000);
        interposer.callback_enter(&mut tcx, AppPc(0x6000));
        assert_eq!(tcx.callback_frames.len(), 2);

        interposer.callback_return(&mut tcx).unwrap();
        assert_eq!(tcx.mc.pc, 0x5000);
        interposer.callback_return(&mut tcx).unwrap();
        assert_eq!(tcx.mc.pc, 0x1000, "outermost context restored");
        assert_eq!(tcx.mc.reg(crate::arch::Reg(3)), 77);
        assert!(interposer.callback_return(&mut tcx).is_err());
    }
}
