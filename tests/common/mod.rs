//! Shared bootstrap for the end-to-end suites: an engine over the toy
//! backend, plus image/run helpers.

use std::sync::Arc;

use shepherd::prelude::*;
use shepherd::toy::{ProgramImage, ToyExecutor, ToyIsa, ToyOs};

/// Builds an engine over the toy backend for `image`.
pub fn boot(image: ProgramImage, options: EngineOptions) -> (Arc<Engine>, Arc<ToyOs>) {
    let os = Arc::new(ToyOs::with_image(image));
    let engine = Engine::builder()
        .isa(Arc::new(ToyIsa))
        .os(os.clone())
        .executor(Arc::new(ToyExecutor))
        .options(options)
        .build()
        .expect("engine build");
    (Arc::new(engine), os)
}

/// Runs one application thread from `entry` on a fresh stack.
pub fn run_thread(engine: &Engine, os: &ToyOs, tid: u64, entry: u64) -> ThreadOutcome {
    let sp = os.alloc_stack();
    engine
        .start_thread(ThreadId(tid), Mcontext::at(AppPc(entry), sp))
        .expect("dispatch loop")
}

/// Asserts the thread ran to a normal exit.
pub fn assert_exited(outcome: &ThreadOutcome) {
    assert!(
        matches!(outcome, ThreadOutcome::Exited),
        "expected a clean exit, got {outcome:?}"
    );
}
