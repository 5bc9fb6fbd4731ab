use thiserror::Error;

use crate::arch::{AppPc, CachePc};

macro_rules! corrupt_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Corrupt {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Corrupt {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants partition into application-visible conditions (faults the engine must re-raise
/// to the application with original semantics), recoverable engine conditions (cache pressure,
/// synch timeouts, wrap misuse), and engine-internal corruption that routes to the fatal path.
///
/// # Error Categories
///
/// ## Application faults
/// - [`Error::AppDecodeFault`] - Application bytes do not decode; re-raised as the
///   architectural fault the CPU would have produced
/// - [`Error::AppUnreadable`] - A page the application would have touched is unreadable
///
/// ## Engine resource conditions
/// - [`Error::OutOfCache`] - A cache partition exhausted its budget even after eviction
/// - [`Error::OutOfMemory`] - An arena or table could not grow
///
/// ## Synchronization
/// - [`Error::SynchTimeout`] - Cooperative synchall wait exceeded its bound
/// - [`Error::SuspendFailed`] - Forced OS-level suspension was denied
/// - [`Error::LockError`] - Thread synchronization failure (poisoned lock)
///
/// ## Translation and redirection
/// - [`Error::Untranslatable`] - A cache PC fell inside a non-restartable mangling region
/// - [`Error::NotInCache`] - A cache PC does not belong to any live fragment
///
/// ## Wrap / replace layer
/// - [`Error::ReplaceExists`] - A replacement is already installed and `override` was not set
/// - [`Error::NotWrapped`] - Unwrap of a pair that was never registered
/// - [`Error::WrapMisuse`] - A context accessor was used from the wrong callback phase
///
/// ## Persisted caches
/// - [`Error::PersistFormat`] - A frozen-cache file failed header or bounds validation
/// - [`Error::PersistIdentity`] - A frozen-cache file does not match the loaded module
///
/// # Examples
///
/// ```rust,ignore
/// use shepherd::{Engine, Error};
///
/// match engine.replace(orig, Some(repl), false) {
///     Ok(()) => {}
///     Err(Error::ReplaceExists(pc)) => {
///         eprintln!("{pc} already replaced; pass override to supersede");
///     }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// Application bytes at the given PC failed to decode.
    ///
    /// The fragment builder surfaces this as a synthetic fragment that re-raises
    /// the exact fault the hardware would have raised at that PC; callers that
    /// see this variant directly are engine-internal.
    #[error("application bytes at {0} do not decode")]
    AppDecodeFault(AppPc),

    /// A page the application would have executed or touched is unreadable.
    ///
    /// Carries the first unreadable address so the synthetic fault can name it.
    #[error("application page at {0:#x} is unreadable")]
    AppUnreadable(u64),

    /// A cache partition exhausted its budget, even after a round of eviction.
    #[error("code cache partition out of space")]
    OutOfCache,

    /// An engine arena or table could not grow.
    #[error("engine out of memory")]
    OutOfMemory,

    /// Cooperative synchall did not reach all threads within the configured bound.
    ///
    /// The synchall driver escalates to forced suspension on this condition; it
    /// is only returned to callers when escalation is disabled or also fails.
    #[error("synchall timed out waiting for {0} thread(s)")]
    SynchTimeout(usize),

    /// The OS refused to suspend a thread during forced synchall.
    #[error("forced suspension of thread {0} failed")]
    SuspendFailed(u64),

    /// An engine lock was poisoned.
    ///
    /// A mutex or rwlock guard was abandoned by a panicking thread, so the
    /// state behind it cannot be trusted. Paths that cannot report this
    /// (the lock helper macros) treat the same condition as fatal instead.
    #[error("engine lock poisoned")]
    LockError,

    /// A cache PC fell inside a non-restartable mangling region with no
    /// recorded boundary to advance or rewind to.
    ///
    /// This is a bug state: every mangling sequence is emitted with
    /// restartable boundaries pre-chosen.
    #[error("cache pc {0} is not translatable")]
    Untranslatable(CachePc),

    /// A cache PC does not belong to any live fragment.
    #[error("cache pc {0} is outside every live fragment")]
    NotInCache(CachePc),

    /// A replacement is already installed for this address.
    #[error("a replacement already exists for {0}")]
    ReplaceExists(AppPc),

    /// Unwrap was called for a (pre, post) pair that was never registered.
    #[error("no wrap registered for {0} with this callback pair")]
    NotWrapped(AppPc),

    /// A wrap-context accessor was used from the wrong callback phase.
    ///
    /// Flagged and ignored by the engine (the operation has no effect);
    /// surfaced so callers can log it.
    #[error("wrap context misuse: {0}")]
    WrapMisuse(&'static str),

    /// A frozen-cache file failed header or bounds validation.
    #[error("persisted cache rejected: {0}")]
    PersistFormat(String),

    /// A frozen-cache file does not match the module it claims to cover.
    #[error("persisted cache identity mismatch for {0}")]
    PersistIdentity(String),

    /// File I/O error.
    ///
    /// Wraps standard I/O errors from persisting or mapping frozen caches.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The engine handle was asked to do something its options forbid.
    #[error("operation disabled by options: {0}")]
    Disabled(&'static str),

    /// Detach could not fully restore native state; the engine stays in place.
    #[error("detach incomplete: {0}")]
    DetachIncomplete(String),

    /// Engine-internal state is corrupt.
    ///
    /// Routes to the central fatal-exit path, which snapshots a diagnostic
    /// record before terminating.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the corruption
    /// * `file` - Source file in which it was detected
    /// * `line` - Source line in which it was detected
    #[error("Corrupt - {file}:{line}: {message}")]
    Corrupt {
        /// The message to be printed for the Corrupt error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockError
    }
}
