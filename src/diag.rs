//! Diagnostic channel.
//!
//! Every recoverable data problem found while loading records or reading and
//! writing object graphs is reported here instead of being returned as an
//! `Err`. The engine keeps going with a documented fallback value, and the
//! embedding application decides what to do with the messages: log them,
//! collect them, or escalate by panicking from its own sink.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Exception,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Exception => "exception",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Receiver of diagnostics. Implementations may be called from whatever thread
/// the engine runs on.
pub trait DiagnosticSink: Send + Sync {
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
    /// Unexpected faults: panics caught inside user hooks and converters, or
    /// errors those hooks returned.
    fn exception(&self, message: &str);
}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn info(&self, message: &str) {
        info!(target: "declad", "{message}");
    }
    fn warning(&self, message: &str) {
        warn!(target: "declad", "{message}");
    }
    fn error(&self, message: &str) {
        error!(target: "declad", "{message}");
    }
    fn exception(&self, message: &str) {
        error!(target: "declad", exception = true, "{message}");
    }
}

/// Installs a global `fmt` subscriber for [`TracingSink`] output, filtered
/// by `RUST_LOG` or else `default_filter`. Returns false if a subscriber was
/// already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}

/// Keeps every diagnostic in memory. Clones share the same buffer, so one
/// handle can be given to the engine while another is inspected.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
    fn push(&self, severity: Severity, message: &str) {
        // a poisoned buffer still holds valid diagnostics
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push(Diagnostic { severity, message: message.to_string() });
    }
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
    pub fn with_severity(&self, severity: Severity) -> Vec<Diagnostic> {
        self.entries().into_iter().filter(|d| d.severity == severity).collect()
    }
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.with_severity(Severity::Error)
    }
    pub fn warnings(&self) -> Vec<Diagnostic> {
        self.with_severity(Severity::Warning)
    }
    pub fn exceptions(&self) -> Vec<Diagnostic> {
        self.with_severity(Severity::Exception)
    }
    /// Number of errors whose message contains `needle`.
    pub fn count_errors_containing(&self, needle: &str) -> usize {
        self.errors().iter().filter(|d| d.message.contains(needle)).count()
    }
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn info(&self, message: &str) {
        self.push(Severity::Info, message);
    }
    fn warning(&self, message: &str) {
        self.push(Severity::Warning, message);
    }
    fn error(&self, message: &str) {
        self.push(Severity::Error, message);
    }
    fn exception(&self, message: &str) {
        self.push(Severity::Exception, message);
    }
}

/// The accumulator the engine reports into. It counts what passes through so
/// that callers can inspect an operation's outcome without a custom sink.
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    warnings: AtomicUsize,
    errors: AtomicUsize,
    exceptions: AtomicUsize,
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            sink,
            warnings: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            exceptions: AtomicUsize::new(0),
        }
    }
    pub fn info(&self, message: impl AsRef<str>) {
        self.sink.info(message.as_ref());
    }
    pub fn warning(&self, message: impl AsRef<str>) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        self.sink.warning(message.as_ref());
    }
    pub fn error(&self, message: impl AsRef<str>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.sink.error(message.as_ref());
    }
    pub fn exception(&self, message: impl AsRef<str>) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
        self.sink.exception(message.as_ref());
    }
    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
    pub fn exception_count(&self) -> usize {
        self.exceptions.load(Ordering::Relaxed)
    }
    /// True when nothing of warning severity or worse has been reported.
    pub fn is_clean(&self) -> bool {
        self.warning_count() == 0 && self.error_count() == 0 && self.exception_count() == 0
    }
    pub fn reset_counts(&self) {
        self.warnings.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.exceptions.store(0, Ordering::Relaxed);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("warnings", &self.warning_count())
            .field("errors", &self.error_count())
            .field("exceptions", &self.exception_count())
            .finish()
    }
}

/// Text of a payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
