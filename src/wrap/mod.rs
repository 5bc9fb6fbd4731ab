//! Function wrapping and replacement.
//!
//! The wrap layer provides deterministic pre/post callbacks around
//! application functions and atomic function replacement, correct in the
//! presence of longjmp- and exception-style nonlocal exits.
//!
//! # Wrapping
//!
//! [`WrapManager::wrap`] registers a pre/post pair for a function address.
//! Multiple wraps may target one address; pre callbacks run in registration
//! order and post callbacks in reverse. On entry to a wrapped function the
//! engine pushes a [`WrapFrame`] carrying the return address, a
//! stack-pointer watermark, and the post obligations; the frame pops either
//! at the recorded post-call site (normal return) or in the watermark sweep
//! run at every dispatch safe point, which detects frames the application
//! jumped past and fires their post callbacks with the abnormal flag. Every
//! pre callback is therefore paired with exactly one post callback.
//!
//! # Replacement
//!
//! [`WrapManager::replace`] installs a redirection so that executing the
//! original address runs the replacement body instead. One replacement per
//! address; a second call fails unless `override` is set, and passing no
//! replacement with `override` removes the redirection. Stale fragments
//! that inlined the original entry are flushed lazily by the engine.
//!
//! # Post-call sites
//!
//! The first entry through a wrapped function records its return address as
//! a post-call site (flushing any fragment already built there so the site
//! re-enters dispatch). Tools that want to avoid those flushes can observe
//! new sites through [`WrapManager::register_post_call_notify`] and pre-seed
//! them with [`WrapManager::mark_as_post_call`] on the next run.

mod context;
mod stack;

pub use context::{WrapContext, WrapPhase};
pub use stack::{SkipCall, WrapFrame, WrapStack};

use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};

use bitflags::bitflags;
use dashmap::DashMap;

use crate::{
    arch::{AppPc, Mcontext, RET_REG, STACK_SLOT},
    dispatch::Dispatcher,
    fragment::FragmentFlags,
    os::OsFacade,
    thread::ThreadContext,
    Error, Result,
};

use stack::PostEntry;

/// A pre callback.
pub type PreFn = Arc<dyn Fn(&mut WrapContext<'_>) + Send + Sync>;
/// A post callback.
pub type PostFn = Arc<dyn Fn(&mut WrapContext<'_>) + Send + Sync>;
/// A post-call-site discovery callback.
pub type NotifyFn = Arc<dyn Fn(AppPc) + Send + Sync>;

bitflags! {
    /// Per-registration behavior flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct WrapFlags: u8 {
        /// Invoke the post callback (with the abnormal flag) when the frame
        /// is unwound by a nonlocal exit. Set by default; clearing it
        /// deliberately breaks the pre/post pairing for this registration.
        const UNWIND_ON_ABNORMAL = 1 << 0;
    }
}

bitflags! {
    /// Process-wide wrap-layer flags. Once set, never cleared.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct GlobalWrapFlags: u8 {
        /// Read return addresses through a guarded probe.
        const SAFE_READ_RETADDR = 1 << 0;
        /// Read and write in-memory arguments through guarded probes.
        const SAFE_READ_ARGS = 1 << 1;
    }
}

/// One wrap registration, built fluently.
///
/// ```rust,ignore
/// engine.wrap(
///     WrapRequest::new(func)
///         .pre(|ctx| { ctx.set_arg(0, 42); })
///         .post(|ctx| { let v = ctx.retval(); ctx.set_retval(v + 1); }),
/// )?;
/// ```
pub struct WrapRequest {
    func: AppPc,
    pre: Option<PreFn>,
    post: Option<PostFn>,
    flags: WrapFlags,
    user_data: u64,
}

impl WrapRequest {
    /// The function this request targets.
    #[must_use]
    pub fn func(&self) -> AppPc {
        self.func
    }

    /// A request for the function at `func` with default flags.
    #[must_use]
    pub fn new(func: AppPc) -> Self {
        WrapRequest {
            func,
            pre: None,
            post: None,
            flags: WrapFlags::UNWIND_ON_ABNORMAL,
            user_data: 0,
        }
    }

    /// Sets the pre callback.
    #[must_use]
    pub fn pre(mut self, f: impl Fn(&mut WrapContext<'_>) + Send + Sync + 'static) -> Self {
        self.pre = Some(Arc::new(f));
        self
    }

    /// Sets the pre callback from an existing handle (for later
    /// [`WrapManager::unwrap`] by identity).
    #[must_use]
    pub fn pre_fn(mut self, f: PreFn) -> Self {
        self.pre = Some(f);
        self
    }

    /// Sets the post callback.
    #[must_use]
    pub fn post(mut self, f: impl Fn(&mut WrapContext<'_>) + Send + Sync + 'static) -> Self {
        self.post = Some(Arc::new(f));
        self
    }

    /// Sets the post callback from an existing handle.
    #[must_use]
    pub fn post_fn(mut self, f: PostFn) -> Self {
        self.post = Some(f);
        self
    }

    /// Replaces the behavior flags.
    #[must_use]
    pub fn flags(mut self, flags: WrapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the initial user datum handed to the pre callback.
    #[must_use]
    pub fn user_data(mut self, value: u64) -> Self {
        self.user_data = value;
        self
    }
}

#[derive(Clone)]
struct WrapRecord {
    id: u64,
    pre: Option<PreFn>,
    post: Option<PostFn>,
    flags: WrapFlags,
    init_user: u64,
}

/// Whether dispatch should restart its loop after the wrap hooks ran.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WrapDisposition {
    /// Proceed to fragment selection for the current tag.
    Continue,
    /// The context was redirected (skip_call); restart the loop.
    Redirect,
}

/// The function wrap/replace registry and its dispatch-time hooks.
pub struct WrapManager {
    wraps: DashMap<AppPc, Vec<WrapRecord>>,
    replaces: DashMap<AppPc, AppPc>,
    post_sites: DashMap<AppPc, ()>,
    notify: Mutex<Vec<NotifyFn>>,
    global_flags: AtomicU8,
    next_id: AtomicU64,
    misuses: AtomicU64,
}

impl WrapManager {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        WrapManager {
            wraps: DashMap::new(),
            replaces: DashMap::new(),
            post_sites: DashMap::new(),
            notify: Mutex::new(Vec::new()),
            global_flags: AtomicU8::new(0),
            next_id: AtomicU64::new(1),
            misuses: AtomicU64::new(0),
        }
    }

    /// Registers a wrap. At least one callback must be present.
    ///
    /// Returns `true` when this is the first registration for the address,
    /// in which case the caller must lazily flush any fragment already built
    /// for it.
    ///
    /// # Errors
    ///
    /// [`Error::WrapMisuse`] when both callbacks are absent.
    pub fn wrap(&self, request: WrapRequest) -> Result<bool> {
        if request.pre.is_none() && request.post.is_none() {
            return Err(Error::WrapMisuse("wrap with neither pre nor post"));
        }
        let record = WrapRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pre: request.pre,
            post: request.post,
            flags: request.flags,
            init_user: request.user_data,
        };
        let mut entry = self.wraps.entry(request.func).or_default();
        entry.push(record);
        tracing::debug!(func = %request.func, count = entry.len(), "wrap registered");
        Ok(entry.len() == 1)
    }

    /// Removes the registration matching this exact callback pair.
    ///
    /// # Errors
    ///
    /// [`Error::NotWrapped`] when no registration matches.
    pub fn unwrap(
        &self,
        func: AppPc,
        pre: Option<&PreFn>,
        post: Option<&PostFn>,
    ) -> Result<()> {
        let mut removed = false;
        if let Some(mut entry) = self.wraps.get_mut(&func) {
            if let Some(pos) = entry.iter().position(|r| callbacks_match(r, pre, post)) {
                entry.remove(pos);
                removed = true;
            }
        }
        if removed {
            self.wraps.remove_if(&func, |_, v| v.is_empty());
            Ok(())
        } else {
            Err(Error::NotWrapped(func))
        }
    }

    /// Whether `func` is wrapped with this exact callback pair.
    #[must_use]
    pub fn is_wrapped(&self, func: AppPc, pre: Option<&PreFn>, post: Option<&PostFn>) -> bool {
        self.wraps
            .get(&func)
            .is_some_and(|entry| entry.iter().any(|r| callbacks_match(r, pre, post)))
    }

    /// Installs, supersedes, or removes a replacement for `orig`.
    ///
    /// Returns `true` when an existing fragment for `orig` must be lazily
    /// flushed (install over cached code, or removal).
    ///
    /// # Errors
    ///
    /// [`Error::ReplaceExists`] when a replacement exists and `override_` is
    /// not set.
    pub fn replace(
        &self,
        orig: AppPc,
        replacement: Option<AppPc>,
        override_: bool,
    ) -> Result<bool> {
        match replacement {
            Some(repl) => {
                if self.replaces.contains_key(&orig) && !override_ {
                    return Err(Error::ReplaceExists(orig));
                }
                self.replaces.insert(orig, repl);
                tracing::debug!(%orig, %repl, "replacement installed");
                Ok(true)
            }
            None => {
                let removed = self.replaces.remove(&orig).is_some();
                if removed {
                    tracing::debug!(%orig, "replacement removed");
                }
                Ok(removed)
            }
        }
    }

    /// The active replacement body for `orig`, if any.
    #[must_use]
    pub fn replacement_for(&self, orig: AppPc) -> Option<AppPc> {
        self.replaces.get(&orig).map(|r| *r)
    }

    /// Whether fragments built at `tag` must re-enter dispatch (wrapped
    /// entry or recorded post-call site).
    #[must_use]
    pub fn entry_needs_dispatch(&self, tag: AppPc) -> bool {
        self.wraps.contains_key(&tag) || self.post_sites.contains_key(&tag)
    }

    /// Pre-seeds `pc` as a post-call site.
    ///
    /// Returns `true` when the site is new (the caller flushes any stale
    /// fragment).
    pub fn mark_as_post_call(&self, pc: AppPc) -> bool {
        let new = self.post_sites.insert(pc, ()).is_none();
        if new {
            self.notify_post_call(pc);
        }
        new
    }

    /// Whether `pc` is a recorded post-call site.
    #[must_use]
    pub fn is_post_wrap(&self, pc: AppPc) -> bool {
        self.post_sites.contains_key(&pc)
    }

    /// Registers a callback observing newly discovered post-call sites.
    pub fn register_post_call_notify(&self, cb: NotifyFn) {
        lock!(self.notify).push(cb);
    }

    /// Unregisters a previously registered discovery callback.
    ///
    /// # Errors
    ///
    /// [`Error::NotWrapped`] (reused) when the callback was never
    /// registered.
    pub fn unregister_post_call_notify(&self, cb: &NotifyFn) -> Result<()> {
        let mut list = lock!(self.notify);
        let before = list.len();
        list.retain(|n| !Arc::ptr_eq(n, cb));
        if list.len() == before {
            return Err(Error::NotWrapped(AppPc(0)));
        }
        Ok(())
    }

    /// Sets process-wide flags; flags accumulate and are never cleared.
    pub fn set_global_flags(&self, flags: GlobalWrapFlags) {
        self.global_flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Current process-wide flags.
    #[must_use]
    pub fn global_flags(&self) -> GlobalWrapFlags {
        GlobalWrapFlags::from_bits_truncate(self.global_flags.load(Ordering::Acquire))
    }

    /// Number of flagged-and-ignored callback misuses so far.
    #[must_use]
    pub fn misuse_count(&self) -> u64 {
        self.misuses.load(Ordering::Acquire)
    }

    /// The dispatch-time hook: normal post-call handling, the abnormal
    /// watermark sweep, then wrapped-entry handling, in that order.
    ///
    /// # Errors
    ///
    /// Propagates flush failures when a post-call site must invalidate a
    /// cached fragment.
    pub fn at_dispatch(
        &self,
        d: &Dispatcher<'_>,
        tcx: &mut ThreadContext,
    ) -> Result<WrapDisposition> {
        let tag = tcx.mc.app_pc();

        // Normal returns: the recorded post-call site with the matching
        // stack depth.
        while let Some(top) = tcx.wrap_stack.top() {
            let normal_return =
                top.retaddr == tag && tcx.mc.sp == top.watermark.wrapping_add(STACK_SLOT);
            if !normal_return {
                break;
            }
            let frame = tcx.wrap_stack.pop().expect("top frame exists");
            self.run_posts(tcx, frame, WrapPhase::Post, d.os);
        }

        // Abnormal unwinds: any frame the stack pointer has moved above was
        // jumped past without returning.
        while let Some(top) = tcx.wrap_stack.top() {
            if tcx.mc.sp <= top.watermark {
                break;
            }
            let frame = tcx.wrap_stack.pop().expect("top frame exists");
            tracing::debug!(func = %frame.func, "abnormal unwind detected");
            self.run_posts(tcx, frame, WrapPhase::PostAbnormal, d.os);
        }

        // Wrapped entry.
        let records: Vec<WrapRecord> = match self.wraps.get(&tag) {
            Some(entry) => entry.value().clone(),
            None => return Ok(WrapDisposition::Continue),
        };

        let retaddr = self.read_retaddr(tcx, d.os);
        let mut frame = WrapFrame {
            func: tag,
            retaddr,
            watermark: tcx.mc.sp,
            posts: records
                .iter()
                .map(|r| PostEntry {
                    id: r.id,
                    post: r.post.clone(),
                    flags: r.flags,
                    user_data: r.init_user,
                })
                .collect(),
        };

        // Pre callbacks in registration order; skip_call short-circuits the
        // rest and suppresses every post.
        let mut skip: Option<SkipCall> = None;
        for (idx, record) in records.iter().enumerate() {
            let Some(pre) = &record.pre else {
                continue;
            };
            let mut misuses = Vec::new();
            let mut ctx = WrapContext {
                phase: WrapPhase::Pre,
                func: tag,
                retaddr,
                mc: &mut tcx.mc,
                os: d.os,
                user_data: &mut frame.posts[idx].user_data,
                skip: &mut skip,
                misuses: &mut misuses,
            };
            pre(&mut ctx);
            self.tally_misuses(&misuses);
            if skip.is_some() {
                break;
            }
        }

        if let Some(skip) = skip {
            // Return to the caller without running the body: pop the return
            // address (plus callee-popped argument bytes), set the return
            // value, and resume at the call site's continuation.
            tcx.mc.set_reg(RET_REG, skip.retval);
            tcx.mc.sp = tcx
                .mc
                .sp
                .wrapping_add(STACK_SLOT)
                .wrapping_add(skip.stdcall_bytes);
            tcx.mc.pc = retaddr.0;
            tracing::debug!(func = %tag, retval = skip.retval, "skip_call");
            return Ok(WrapDisposition::Redirect);
        }

        tcx.wrap_stack.push(frame);

        // First sighting of this return address: record the post-call site
        // and invalidate any fragment already built there, so the return
        // re-enters dispatch.
        if self.post_sites.insert(retaddr, ()).is_none() {
            self.notify_post_call(retaddr);
            let stale = d
                .shared_table
                .lookup(retaddr)
                .and_then(|id| d.slab.get(id))
                .is_some_and(|f| !f.flags().contains(FragmentFlags::CANNOT_LINK));
            if stale {
                d.flush_tag(Some(tcx.shared.as_ref()), retaddr)?;
            }
        }
        Ok(WrapDisposition::Continue)
    }

    /// Detach support: every active frame's posts fire with the abnormal
    /// flag so no pre callback is left unpaired.
    pub fn drain_for_detach(&self, tcx: &mut ThreadContext, os: &dyn OsFacade) {
        while let Some(frame) = tcx.wrap_stack.pop() {
            self.run_posts(tcx, frame, WrapPhase::PostAbnormal, os);
        }
    }

    fn run_posts(
        &self,
        tcx: &mut ThreadContext,
        mut frame: WrapFrame,
        phase: WrapPhase,
        os: &dyn OsFacade,
    ) {
        // Reverse registration order.
        for entry in frame.posts.iter_mut().rev() {
            let Some(post) = &entry.post else {
                continue;
            };
            if phase == WrapPhase::PostAbnormal
                && !entry.flags.contains(WrapFlags::UNWIND_ON_ABNORMAL)
            {
                continue;
            }
            let mut dummy = Mcontext::default();
            let mut misuses = Vec::new();
            let mc: &mut Mcontext = if phase == WrapPhase::PostAbnormal {
                &mut dummy
            } else {
                &mut tcx.mc
            };
            let mut skip = None;
            let mut ctx = WrapContext {
                phase,
                func: frame.func,
                retaddr: frame.retaddr,
                mc,
                os,
                user_data: &mut entry.user_data,
                skip: &mut skip,
                misuses: &mut misuses,
            };
            post(&mut ctx);
            self.tally_misuses(&misuses);
        }
    }

    fn read_retaddr(&self, tcx: &mut ThreadContext, os: &dyn OsFacade) -> AppPc {
        tcx.try_frames.enter("wrap-retaddr");
        let mut buf = [0u8; 8];
        let retaddr = match os.read_app(tcx.mc.sp, &mut buf) {
            Ok(8) => AppPc(u64::from_le_bytes(buf)),
            _ => AppPc(0),
        };
        tcx.try_frames.exit();
        retaddr
    }

    fn notify_post_call(&self, pc: AppPc) {
        let list = lock!(self.notify).clone();
        for cb in list {
            cb(pc);
        }
    }

    fn tally_misuses(&self, misuses: &[&'static str]) {
        for misuse in misuses {
            self.misuses.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(misuse, "wrap callback misuse ignored");
        }
    }
}

impl Default for WrapManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WrapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapManager")
            .field("wrapped", &self.wraps.len())
            .field("replaced", &self.replaces.len())
            .field("post_sites", &self.post_sites.len())
            .finish()
    }
}

fn callbacks_match(record: &WrapRecord, pre: Option<&PreFn>, post: Option<&PostFn>) -> bool {
    let pre_match = match (&record.pre, pre) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    let post_match = match (&record.post, post) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    };
    pre_match && post_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_is_wrapped_pair_identity() {
        let manager = WrapManager::new();
        let pre: PreFn = Arc::new(|_ctx| {});
        let post: PostFn = Arc::new(|_ctx| {});
        manager
            .wrap(
                WrapRequest::new(AppPc(0x100))
                    .pre_fn(pre.clone())
                    .post_fn(post.clone()),
            )
            .unwrap();

        assert!(manager.is_wrapped(AppPc(0x100), Some(&pre), Some(&post)));
        let other: PreFn = Arc::new(|_ctx| {});
        assert!(!manager.is_wrapped(AppPc(0x100), Some(&other), Some(&post)));
    }

    #[test]
    fn test_unwrap_restores_unwrapped_state() {
        let manager = WrapManager::new();
        let pre: PreFn = Arc::new(|_ctx| {});
        manager
            .wrap(WrapRequest::new(AppPc(0x100)).pre_fn(pre.clone()))
            .unwrap();
        manager.unwrap(AppPc(0x100), Some(&pre), None).unwrap();
        assert!(!manager.is_wrapped(AppPc(0x100), Some(&pre), None));
        assert!(!manager.entry_needs_dispatch(AppPc(0x100)));
        assert!(manager.unwrap(AppPc(0x100), Some(&pre), None).is_err());
    }

    #[test]
    fn test_replace_exclusivity_and_override() {
        let manager = WrapManager::new();
        manager.replace(AppPc(0x100), Some(AppPc(0x200)), false).unwrap();
        assert!(matches!(
            manager.replace(AppPc(0x100), Some(AppPc(0x300)), false),
            Err(Error::ReplaceExists(_))
        ));
        manager.replace(AppPc(0x100), Some(AppPc(0x300)), true).unwrap();
        assert_eq!(manager.replacement_for(AppPc(0x100)), Some(AppPc(0x300)));
        manager.replace(AppPc(0x100), None, true).unwrap();
        assert_eq!(manager.replacement_for(AppPc(0x100)), None);
    }

    #[test]
    fn test_wrap_requires_a_callback() {
        let manager = WrapManager::new();
        assert!(matches!(
            manager.wrap(WrapRequest::new(AppPc(0x100))),
            Err(Error::WrapMisuse(_))
        ));
    }

    #[test]
    fn test_post_call_notify_fires_once_per_site() {
        let manager = WrapManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = seen.clone();
        manager.register_post_call_notify(Arc::new(move |pc| {
            observer.lock().unwrap().push(pc);
        }));
        assert!(manager.mark_as_post_call(AppPc(0x500)));
        assert!(!manager.mark_as_post_call(AppPc(0x500)));
        assert!(manager.is_post_wrap(AppPc(0x500)));
        assert_eq!(seen.lock().unwrap().as_slice(), &[AppPc(0x500)]);
    }
}
