//! The engine handle: one value owning every shared subsystem.
//!
//! There is no global mutable state. Everything the original design kept in
//! process globals lives in an [`Engine`], built once by the injector (or
//! the embedding test) and passed by reference into every entry point; the
//! only process-wide bits are the initialization barrier and the detach
//! flag, both fields of the handle. Fields being private by construction
//! replaces the original's protect-the-data-section dance.
//!
//! # Lifecycle
//!
//! The injector jumps to [`Engine::takeover`] with the saved machine
//! context; each subsequent application thread enters through
//! [`Engine::start_thread`], which runs the thread-birth hook, the thread's
//! entire dispatch life, and the thread-death hook. [`Engine::shutdown`]
//! is the process-death hook: it synchs every thread to a safe point and
//! tears shared state down in reverse dependency order, unmapping the cache
//! last.

mod fatal;

pub use fatal::{DiagnosticRecord, DiagnosticSink, FATAL_EXIT_CODE};

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::{
    arch::{AppPc, Isa, Mcontext},
    cache::CodeCache,
    config::EngineOptions,
    dispatch::{CacheExecutor, Dispatcher, ThreadOutcome},
    fragment::FragmentSlab,
    ibl::IblTable,
    interpose::Interposer,
    link::Linker,
    os::{ExceptionRecord, OsFacade, ThreadId},
    persist::{self, FrozenRegistry, ModuleInfo},
    synch::Synchall,
    table::SharedTable,
    thread::{ThreadContext, ThreadRegistry},
    wrap::{NotifyFn, PostFn, PreFn, WrapManager, WrapRequest},
    Error, Result,
};

/// Sentinel the injector places below the saved context.
pub const INJECTOR_SENTINEL: u64 = u64::from_le_bytes(*b"SHEPHERD");

/// The frame the injector hands to [`Engine::takeover`].
#[derive(Clone, Debug)]
pub struct InjectorFrame {
    /// Must equal [`INJECTOR_SENTINEL`].
    pub sentinel: u64,
    /// The application's machine context at interposition time.
    pub context: Mcontext,
    /// Optional engine home directory (persisted caches, dumps).
    pub home_dir: Option<String>,
}

/// The process-virtualization engine.
///
/// Cheap to share: every subsystem is behind an `Arc`, and all entry points
/// take `&self`. One engine per shepherded process.
pub struct Engine {
    isa: Arc<dyn Isa>,
    os: Arc<dyn OsFacade>,
    executor: Arc<dyn CacheExecutor>,
    options: EngineOptions,

    cache: Arc<CodeCache>,
    slab: Arc<FragmentSlab>,
    shared_table: Arc<SharedTable>,
    ibl: Arc<IblTable>,
    linker: Arc<Linker>,
    registry: Arc<ThreadRegistry>,
    synch: Arc<Synchall>,
    interpose: Arc<Interposer>,
    wrap: Arc<WrapManager>,
    trace: Arc<crate::trace::TraceManager>,
    frozen: Arc<FrozenRegistry>,

    modules: Mutex<Vec<ModuleInfo>>,
    home_dir: Mutex<Option<PathBuf>>,
    sink: DiagnosticSink,

    initialized: AtomicBool,
    detaching: AtomicBool,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The options the engine was built with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The async interposer (handler registration, event posting).
    #[must_use]
    pub fn interposer(&self) -> &Interposer {
        &self.interpose
    }

    /// The wrap/replace registry (queries; mutation goes through the engine
    /// so cached code is invalidated correctly).
    #[must_use]
    pub fn wrap_manager(&self) -> &WrapManager {
        &self.wrap
    }

    /// One thread's view of the engine.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            isa: self.isa.as_ref(),
            os: self.os.as_ref(),
            cache: &self.cache,
            slab: &self.slab,
            shared_table: &self.shared_table,
            ibl: &self.ibl,
            linker: &self.linker,
            executor: self.executor.as_ref(),
            wrap: &self.wrap,
            interpose: &self.interpose,
            trace: &self.trace,
            synch: &self.synch,
            frozen: &self.frozen,
            options: &self.options,
            detaching: &self.detaching,
        }
    }

    /// The injector's entry point: validates the frame and begins dispatch
    /// at the saved PC on the calling thread.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`] for a bad sentinel; otherwise as
    /// [`Engine::start_thread`].
    pub fn takeover(&self, tid: ThreadId, frame: InjectorFrame) -> Result<ThreadOutcome> {
        if frame.sentinel != INJECTOR_SENTINEL {
            return Err(corrupt_error!(
                "injector frame sentinel {:#x} is invalid",
                frame.sentinel
            ));
        }
        if let Some(home) = frame.home_dir {
            *lock!(self.home_dir) = Some(PathBuf::from(home));
        }
        self.initialized.store(true, Ordering::Release);
        tracing::info!(%tid, pc = frame.context.pc, "takeover");
        self.start_thread(tid, frame.context)
    }

    /// Shepherds one application thread for its lifetime: thread-birth hook,
    /// the dispatch loop, thread-death hook.
    ///
    /// # Errors
    ///
    /// Engine-internal corruption; application-visible ends are
    /// [`ThreadOutcome`]s.
    pub fn start_thread(&self, tid: ThreadId, mc: Mcontext) -> Result<ThreadOutcome> {
        let mut tcx = ThreadContext::new(tid, mc);
        self.registry.register(tcx.shared.clone());
        tracing::debug!(%tid, "thread attached");

        let result = self.dispatcher().run(&mut tcx);
        if let Err(err) = &result {
            // Not locally recoverable: snapshot state for the embedder, who
            // terminates with FATAL_EXIT_CODE.
            self.report_fatal(&err.to_string());
        }

        self.thread_death(&mut tcx);
        result
    }

    /// The thread-death hook: tears down private fragments, the private
    /// table, and the registry entry.
    fn thread_death(&self, tcx: &mut ThreadContext) {
        for (_tag, id) in tcx.table.drain() {
            if let Some(frag) = self.slab.get(id) {
                self.linker.unlink_incoming(id);
                self.linker.unlink_outgoing(id, &frag);
                self.ibl.remove(frag.tag());
                self.cache.unregister_fragment(frag.slot(), id);
            }
            self.slab.remove(id);
        }
        self.registry.unregister(tcx.tid());
        tcx.shared.set_state(crate::thread::RunState::Exited);
        tracing::debug!(tid = %tcx.tid(), "thread detached from registry");
    }

    /// Registers a pre/post wrap for `request.func`; lazily flushes any
    /// fragment already cached for it so the entry re-enters dispatch.
    ///
    /// # Errors
    ///
    /// As [`WrapManager::wrap`], plus flush failures.
    pub fn wrap(&self, request: WrapRequest) -> Result<()> {
        let func = request.func();
        let first = self.wrap.wrap(request)?;
        if first {
            self.dispatcher().flush_tag(None, func)?;
        }
        Ok(())
    }

    /// Removes a wrap registration by callback identity.
    ///
    /// # Errors
    ///
    /// [`Error::NotWrapped`] when no registration matches.
    pub fn unwrap(&self, func: AppPc, pre: Option<&PreFn>, post: Option<&PostFn>) -> Result<()> {
        self.wrap.unwrap(func, pre, post)?;
        if !self.wrap.entry_needs_dispatch(func) {
            self.dispatcher().flush_tag(None, func)?;
        }
        Ok(())
    }

    /// Whether `func` is wrapped with this exact callback pair.
    #[must_use]
    pub fn is_wrapped(&self, func: AppPc, pre: Option<&PreFn>, post: Option<&PostFn>) -> bool {
        self.wrap.is_wrapped(func, pre, post)
    }

    /// Installs, supersedes, or removes a function replacement, lazily
    /// flushing cached code for the original.
    ///
    /// # Errors
    ///
    /// [`Error::ReplaceExists`] when a replacement exists and `override_`
    /// is not set.
    pub fn replace(&self, orig: AppPc, replacement: Option<AppPc>, override_: bool) -> Result<()> {
        let needs_flush = self.wrap.replace(orig, replacement, override_)?;
        if needs_flush {
            self.dispatcher().flush_tag(None, orig)?;
        }
        Ok(())
    }

    /// Pre-seeds a post-call site (persisted-tool support), flushing any
    /// stale fragment there.
    ///
    /// # Errors
    ///
    /// Flush failures.
    pub fn mark_as_post_call(&self, pc: AppPc) -> Result<()> {
        if self.wrap.mark_as_post_call(pc) {
            self.dispatcher().flush_tag(None, pc)?;
        }
        Ok(())
    }

    /// Registers a post-call-site discovery callback.
    pub fn register_post_call_notify(&self, cb: NotifyFn) {
        self.wrap.register_post_call_notify(cb);
    }

    /// Flushes the fragment cached for `tag`, returning whether one existed.
    /// Returns only after every other thread is observed outside it.
    ///
    /// # Errors
    ///
    /// Synchall failures.
    pub fn flush(&self, tag: AppPc) -> Result<bool> {
        self.dispatcher().flush_tag(None, tag)
    }

    /// Requests runtime detach: every thread leaves the cache at its next
    /// safe point, drains its wrap stack with the abnormal flag, and
    /// returns [`ThreadOutcome::Detached`] from its dispatch loop.
    ///
    /// # Errors
    ///
    /// [`Error::Disabled`] unless the options permit detach.
    pub fn detach(&self) -> Result<()> {
        if !self.options.detach_allowed {
            return Err(Error::Disabled("detach-allowed"));
        }
        self.detaching.store(true, Ordering::Release);
        for shared in self.registry.all() {
            shared
                .interrupt
                .store(true, std::sync::atomic::Ordering::Release);
        }
        tracing::info!("detach requested");
        Ok(())
    }

    /// Whether a detach is in progress.
    #[must_use]
    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::Acquire)
    }

    /// Registers a module for persisted-cache eligibility.
    pub fn register_module(&self, module: ModuleInfo) {
        lock!(self.modules).push(module);
    }

    /// Freezes every registered module's shared blocks into `out_dir`.
    ///
    /// # Errors
    ///
    /// [`Error::Disabled`] unless freezing is enabled; otherwise the first
    /// per-module failure.
    pub fn freeze_modules(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        if !self.options.coarse_enable_freeze {
            return Err(Error::Disabled("coarse-enable-freeze"));
        }
        let modules = lock!(self.modules).clone();
        persist::freeze_all(
            self.os.as_ref(),
            &self.shared_table,
            &self.slab,
            &self.cache,
            &modules,
            out_dir,
        )
    }

    /// Loads a frozen module cache file.
    ///
    /// # Errors
    ///
    /// [`Error::Disabled`] unless persistence is enabled; format and
    /// identity failures otherwise.
    pub fn load_persisted(&self, path: &Path) -> Result<()> {
        if !self.options.use_persisted {
            return Err(Error::Disabled("use-persisted"));
        }
        self.frozen.load_file(self.os.as_ref(), path)
    }

    /// Queues an asynchronous event for a thread (the exception hook's
    /// deferred path).
    pub fn post_event(&self, tid: ThreadId, record: ExceptionRecord) {
        self.interpose.post(tid, record);
    }

    /// The fragment currently registered for `tag` (shared or frozen
    /// partitions; never builds).
    #[must_use]
    pub fn fragment_for(&self, tag: AppPc) -> Option<crate::fragment::FragmentId> {
        self.shared_table
            .lookup(tag)
            .filter(|id| self.slab.get(*id).is_some())
            .or_else(|| self.frozen.lookup(tag))
    }

    /// The flags of a fragment, when its id is still live.
    #[must_use]
    pub fn fragment_flags(&self, id: crate::fragment::FragmentId) -> Option<crate::fragment::FragmentFlags> {
        self.slab.get(id).map(|f| f.flags())
    }

    /// Whether the in-cache indirect lookup currently resolves `tag`.
    #[must_use]
    pub fn ibl_resolves(&self, tag: AppPc) -> bool {
        self.ibl.probe(tag).is_some()
    }

    /// A point-in-time summary of cache contents.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut fragments = 0usize;
        let mut traces = 0usize;
        self.slab.for_each(|_, frag| {
            fragments += 1;
            if frag.flags().contains(crate::fragment::FragmentFlags::IS_TRACE) {
                traces += 1;
            }
        });
        EngineStats {
            fragments,
            traces,
            shared_bytes: self.cache.used_bytes(crate::cache::Partition::Shared),
            trace_bytes: self.cache.used_bytes(crate::cache::Partition::Trace),
            threads: self.registry.len(),
        }
    }

    /// Routes the configured diagnostic destination.
    pub fn set_diagnostic_sink(&self, sink: Box<dyn std::io::Write + Send>) {
        self.sink.set(sink);
    }

    /// Captures and emits the fatal diagnostic record for `reason`.
    ///
    /// The caller terminates the process with [`FATAL_EXIT_CODE`] afterwards
    /// (library code never exits on its own). When an external dump tool is
    /// configured it is spawned; otherwise a live-dump summary rides along
    /// in the record.
    pub fn report_fatal(&self, reason: &str) -> DiagnosticRecord {
        let mut record = DiagnosticRecord::capture(reason, &self.registry);
        if let Some(tool) = &self.options.external_dump {
            match std::process::Command::new(tool)
                .arg(std::process::id().to_string())
                .spawn()
            {
                Ok(_) => tracing::info!(tool, "external dump tool spawned"),
                Err(err) => tracing::warn!(tool, %err, "external dump tool failed to spawn"),
            }
        } else if self.options.live_dump {
            record.reason.push_str(&format!(
                " [live: {} fragments, {} shared bytes]",
                self.slab.len(),
                self.cache.used_bytes(crate::cache::Partition::Shared),
            ));
        }
        self.sink.emit(&record);
        record
    }

    /// The process-death hook: synch every thread to a safe point, then
    /// tear down shared state in reverse dependency order; the cache is
    /// unmapped last.
    ///
    /// # Errors
    ///
    /// Synchall failures.
    pub fn shutdown(&self) -> Result<()> {
        self.synch.barrier(
            None,
            self.os.as_ref(),
            &self.cache,
            &self.slab,
            || {},
        )?;

        self.ibl.clear();
        let mut ids = Vec::new();
        self.slab.for_each(|id, _| ids.push(id));
        for id in ids {
            if let Some(frag) = self.slab.get(id) {
                self.linker.unlink_incoming(id);
                self.linker.unlink_outgoing(id, &frag);
                self.shared_table.remove_match(frag.tag(), id);
                self.cache.unregister_fragment(frag.slot(), id);
            }
            self.slab.remove(id);
        }
        self.cache.release_all()?;
        tracing::info!("engine shut down");
        Ok(())
    }
}

/// A point-in-time summary of engine contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStats {
    /// Live fragments, all partitions.
    pub fragments: usize,
    /// Live trace fragments.
    pub traces: usize,
    /// Bytes charged against the shared partition.
    pub shared_bytes: usize,
    /// Bytes charged against the trace partition.
    pub trace_bytes: usize,
    /// Registered threads.
    pub threads: usize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("threads", &self.registry.len())
            .field("fragments", &self.slab.len())
            .field("detaching", &self.is_detaching())
            .finish()
    }
}

/// Builds an [`Engine`] from its three external collaborators and options.
#[derive(Default)]
pub struct EngineBuilder {
    isa: Option<Arc<dyn Isa>>,
    os: Option<Arc<dyn OsFacade>>,
    executor: Option<Arc<dyn CacheExecutor>>,
    options: EngineOptions,
}

impl EngineBuilder {
    /// Sets the machine-code backend.
    #[must_use]
    pub fn isa(mut self, isa: Arc<dyn Isa>) -> Self {
        self.isa = Some(isa);
        self
    }

    /// Sets the host facade.
    #[must_use]
    pub fn os(mut self, os: Arc<dyn OsFacade>) -> Self {
        self.os = Some(os);
        self
    }

    /// Sets the cache-execution backend.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn CacheExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Assembles the engine.
    ///
    /// # Errors
    ///
    /// [`Error::Disabled`] naming the missing collaborator.
    pub fn build(self) -> Result<Engine> {
        let isa = self.isa.ok_or(Error::Disabled("isa backend required"))?;
        let os = self.os.ok_or(Error::Disabled("os facade required"))?;
        let executor = self
            .executor
            .ok_or(Error::Disabled("cache executor required"))?;
        let options = self.options;

        let cache = Arc::new(CodeCache::new(os.clone(), options.cache));
        let slab = Arc::new(FragmentSlab::new());
        let shared_table = Arc::new(SharedTable::new());
        let ibl = Arc::new(IblTable::new(options.ibl_bits));
        let linker = Arc::new(Linker::new(slab.clone(), cache.clone()));
        let registry = Arc::new(ThreadRegistry::new());
        let synch = Arc::new(Synchall::new(registry.clone(), options.synch_timeout));
        let interpose = Arc::new(Interposer::new(
            cache.clone(),
            slab.clone(),
            registry.clone(),
        ));
        let wrap = Arc::new(WrapManager::new());
        let trace = Arc::new(crate::trace::TraceManager::new(
            options.trace_threshold,
            options.trace_max_blocks,
        ));
        let frozen = Arc::new(FrozenRegistry::new(slab.clone(), cache.clone()));

        Ok(Engine {
            isa,
            os,
            executor,
            options,
            cache,
            slab,
            shared_table,
            ibl,
            linker,
            registry,
            synch,
            interpose,
            wrap,
            trace,
            frozen,
            modules: Mutex::new(Vec::new()),
            home_dir: Mutex::new(None),
            sink: DiagnosticSink::new(),
            initialized: AtomicBool::new(false),
            detaching: AtomicBool::new(false),
        })
    }
}
