//! The per-thread wrap stack: active pre/post frames.

use crate::arch::AppPc;
use crate::wrap::{PostFn, WrapFlags};

/// A requested skip of the wrapped function's body.
#[derive(Clone, Copy, Debug)]
pub struct SkipCall {
    /// Return value handed to the caller.
    pub retval: u64,
    /// Callee-popped argument bytes for stdcall-style functions.
    pub stdcall_bytes: u64,
}

/// One post-callback obligation within a frame.
pub(crate) struct PostEntry {
    /// Registration id of the wrap record.
    pub id: u64,
    /// The post callback, when one was registered.
    pub post: Option<PostFn>,
    /// Behavior flags of the record.
    pub flags: WrapFlags,
    /// The user datum threaded from the matching pre callback.
    pub user_data: u64,
}

/// One active wrapped-call frame.
///
/// Pushed when dispatch enters a wrapped function, popped either at the
/// recorded post-call site (normal return) or by the watermark sweep
/// (longjmp- or exception-style unwind).
pub struct WrapFrame {
    /// The wrapped function.
    pub func: AppPc,
    /// Return address read at entry.
    pub retaddr: AppPc,
    /// Stack pointer at entry; the frame is dead once the application's
    /// stack pointer has moved above it.
    pub watermark: u64,
    /// Post obligations, in registration order (run in reverse).
    pub(crate) posts: Vec<PostEntry>,
}

/// The per-thread stack of active wrap frames.
///
/// Strictly LIFO: a frame can only be popped when every frame pushed after
/// it is gone, which the watermark sweep guarantees even when the
/// application unwinds several frames in one jump.
#[derive(Default)]
pub struct WrapStack {
    frames: Vec<WrapFrame>,
}

impl WrapStack {
    /// An empty stack.
    #[must_use]
    pub fn new() -> Self {
        WrapStack::default()
    }

    pub(crate) fn push(&mut self, frame: WrapFrame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<WrapFrame> {
        self.frames.pop()
    }

    /// The innermost active frame.
    #[must_use]
    pub fn top(&self) -> Option<&WrapFrame> {
        self.frames.last()
    }

    /// Number of active frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl std::fmt::Debug for WrapStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapStack")
            .field("depth", &self.frames.len())
            .finish()
    }
}
