//! The central fatal-exit path and its diagnostic record.

use std::io::Write;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::thread::ThreadRegistry;

/// Exit code a process terminates with after a fatal engine error.
pub const FATAL_EXIT_CODE: i32 = 0x8b;

/// The diagnostic record emitted on abnormal termination.
#[derive(Debug)]
pub struct DiagnosticRecord {
    /// Wall-clock time of the failure.
    pub timestamp: SystemTime,
    /// Process identity.
    pub pid: u32,
    /// Engine version string.
    pub version: &'static str,
    /// The fatal reason.
    pub reason: String,
    /// Compact thread dump: (thread id, run state).
    pub threads: Vec<(u64, String)>,
}

impl DiagnosticRecord {
    /// Captures a record for `reason` with a compact thread dump.
    #[must_use]
    pub fn capture(reason: &str, registry: &ThreadRegistry) -> Self {
        DiagnosticRecord {
            timestamp: SystemTime::now(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            reason: reason.to_string(),
            threads: registry
                .all()
                .iter()
                .map(|t| (t.tid().0, t.state().to_string()))
                .collect(),
        }
    }

    /// Renders the record for the configured sink.
    #[must_use]
    pub fn render(&self) -> String {
        let since_epoch = self
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut out = String::new();
        out.push_str(&format!(
            "fatal: {}\ntime: {since_epoch}\npid: {}\nversion: {}\n",
            self.reason, self.pid, self.version
        ));
        out.push_str(&format!("threads: {}\n", self.threads.len()));
        for (tid, state) in &self.threads {
            out.push_str(&format!("  tid {tid}: {state}\n"));
        }
        out
    }
}

/// The configured destination for diagnostic records.
pub struct DiagnosticSink {
    inner: Mutex<Option<Box<dyn Write + Send>>>,
}

impl DiagnosticSink {
    /// A sink with no destination (records go to the log only).
    #[must_use]
    pub fn new() -> Self {
        DiagnosticSink {
            inner: Mutex::new(None),
        }
    }

    /// Replaces the destination.
    pub fn set(&self, sink: Box<dyn Write + Send>) {
        *lock!(self.inner) = Some(sink);
    }

    /// Emits a record to the destination, when one is configured.
    pub fn emit(&self, record: &DiagnosticRecord) {
        tracing::error!(reason = %record.reason, "fatal engine error");
        if let Some(sink) = lock!(self.inner).as_mut() {
            let _ = sink.write_all(record.render().as_bytes());
            let _ = sink.flush();
        }
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticSink").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_renders_reason_and_pid() {
        let registry = ThreadRegistry::new();
        let record = DiagnosticRecord::capture("translation failed", &registry);
        let text = record.render();
        assert!(text.contains("fatal: translation failed"));
        assert!(text.contains(&format!("pid: {}", std::process::id())));
        assert!(text.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_sink_receives_rendered_record() {
        #[derive(Clone, Default)]
        struct Buffer(Arc<Mutex<Vec<u8>>>);
        impl Write for Buffer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Buffer::default();
        let sink = DiagnosticSink::new();
        sink.set(Box::new(buffer.clone()));

        let registry = ThreadRegistry::new();
        sink.emit(&DiagnosticRecord::capture("out of cache", &registry));
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("fatal: out of cache"));
    }
}
