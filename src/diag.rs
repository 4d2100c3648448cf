//! Failure bookkeeping for the monitoring session.
//!
//! Workers do not abort the session when they fail; each worker stores its
//! failure in a one-shot slot and the supervisor reads every slot once during
//! shutdown, folding them into a single aggregated error which is surfaced to
//! the exception callback and to the caller of `FileMonitor::join`.  The only
//! exception is the `terminate_all_on_failure` policy, under which the first
//! stored failure immediately requests global termination.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Mutex;

/// The observation discipline or role of the worker that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// A per-file worker re-parsing the whole file on each change.
    Snapshot,
    /// A per-file worker reading appended bytes only.
    Incremental,
    /// A per-request worker expanding glob patterns.
    Discovery,
    /// The supervisor itself; reserved for internal invariant breaches.
    Supervisor,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Snapshot => write!(f, "track"),
            WorkerKind::Incremental => write!(f, "tail"),
            WorkerKind::Discovery => write!(f, "discover"),
            WorkerKind::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// A single worker failure, as stored in the registry.
///
/// `source` is the watched path for file workers and the glob pattern for
/// discovery workers.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    /// Role of the failed worker.
    pub kind: WorkerKind,
    /// Path or pattern the worker was responsible for.
    pub source: String,
    /// Human-readable description of what went wrong.
    pub message: String,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.source, self.message)
    }
}

/// Failure reasons a worker can terminate with.
///
/// This is the internal currency of the worker loops; it is flattened into a
/// `WorkerFailure` message when stored.
#[derive(Debug)]
pub enum WorkerError {
    /// A snapshot or delta parser returned an error.
    Parse(crate::parser::ParseError),
    /// Reading the watched file failed with something other than not-found.
    Io(io::Error),
    /// No parser could be resolved for the watched path.
    NoParser(String),
    /// Glob expansion failed in a discovery worker.
    Pattern(String),
    /// User code panicked inside a record callback.
    Callback(String),
    /// The worker thread itself panicked.
    Panic(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Parse(err) => write!(f, "parser failure: {err}"),
            WorkerError::Io(err) => write!(f, "read failure: {err}"),
            WorkerError::NoParser(path) => write!(f, "no parser available for {path}"),
            WorkerError::Pattern(msg) => write!(f, "pattern expansion failure: {msg}"),
            WorkerError::Callback(msg) => write!(f, "callback panicked: {msg}"),
            WorkerError::Panic(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

impl Error for WorkerError {}

impl From<crate::parser::ParseError> for WorkerError {
    fn from(err: crate::parser::ParseError) -> Self {
        WorkerError::Parse(err)
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        WorkerError::Io(err)
    }
}

/// Shared registry of worker failures.
///
/// Writes are one-shot per worker; the supervisor snapshots the registry
/// during shutdown.
#[derive(Debug, Default)]
pub struct FailureRegistry {
    slots: Mutex<Vec<WorkerFailure>>,
}

impl FailureRegistry {
    /// Record one worker's failure.
    pub fn store(&self, failure: WorkerFailure) {
        log::warn!("{failure}");
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.push(failure);
    }

    /// True when no worker has failed so far.
    pub fn is_empty(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Copy of all stored failures, in storage order.
    pub fn snapshot(&self) -> Vec<WorkerFailure> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A configuration problem detected synchronously at registration time.
#[derive(Debug)]
pub enum ConfigError {
    /// A request was registered with no glob patterns.
    EmptyGlobs,
    /// `labels` was given but its length differs from `tracked`.
    LabelCount {
        /// Number of tracked-value entries.
        tracked: usize,
        /// Number of label entries.
        labels: usize,
    },
    /// A single-capture regex at this position has no label to deliver under.
    MissingLabel(usize),
    /// A tracked regex must have exactly one or two capture groups.
    CaptureCount {
        /// Position of the offending entry.
        position: usize,
        /// Number of capture groups the regex actually has.
        groups: usize,
    },
    /// `track`/`tail` was called after `run`.
    AlreadyRunning,
    /// The same glob pattern was registered under both disciplines.
    DisciplineClash(String),
    /// An exclusion pattern failed to compile.
    BadExclusion(glob::PatternError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyGlobs => write!(f, "a request needs at least one glob pattern"),
            ConfigError::LabelCount { tracked, labels } => write!(
                f,
                "labels length {labels} does not match tracked values length {tracked}"
            ),
            ConfigError::MissingLabel(position) => write!(
                f,
                "tracked value {position} is a single-capture pattern and needs a label"
            ),
            ConfigError::CaptureCount { position, groups } => write!(
                f,
                "tracked value {position} has {groups} capture groups, expected one or two"
            ),
            ConfigError::AlreadyRunning => {
                write!(f, "requests cannot be registered once the monitor is running")
            }
            ConfigError::DisciplineClash(pattern) => write!(
                f,
                "pattern {pattern:?} is already registered under the other discipline"
            ),
            ConfigError::BadExclusion(err) => write!(f, "invalid exclusion pattern: {err}"),
        }
    }
}

impl Error for ConfigError {}

impl From<glob::PatternError> for ConfigError {
    fn from(err: glob::PatternError) -> Self {
        ConfigError::BadExclusion(err)
    }
}

/// Top-level error surfaced by the monitoring session.
#[derive(Debug)]
pub enum MonitorError {
    /// Rejected at registration time, before any worker existed.
    Config(ConfigError),
    /// One or more workers failed during the run; delivered once, at
    /// termination.
    Workers(Vec<WorkerFailure>),
}

impl MonitorError {
    /// The aggregated one-line message delivered to the exception callback.
    #[must_use]
    pub fn aggregate(failures: &[WorkerFailure]) -> String {
        let fragments: Vec<String> = failures.iter().map(ToString::to_string).collect();
        format!(
            "{} worker(s) failed: {}",
            failures.len(),
            fragments.join("; ")
        )
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Config(err) => write!(f, "{err}"),
            MonitorError::Workers(failures) => f.write_str(&MonitorError::aggregate(failures)),
        }
    }
}

impl Error for MonitorError {}

impl From<ConfigError> for MonitorError {
    fn from(err: ConfigError) -> Self {
        MonitorError::Config(err)
    }
}
