//! Session options and observation requests.
//!
//! Options are constant for the lifetime of the monitor, in the manner of a
//! plain struct with a `Default` so callers can use struct-update syntax for
//! the handful of fields they care about.  Requests are validated once at
//! registration; everything a worker later relies on (label pairing, capture
//! group counts) is checked here and reported synchronously.

use crate::diag::ConfigError;
use crate::extract::{SkipPattern, Tracked};
use crate::parser::{DeltaParser, FileFormat, Payload, SnapshotParser};
use itertools::{EitherOrBoth, Itertools};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A record sink: receives the extracted payload and the record metadata.
pub type RecordCallback = Arc<dyn Fn(&Payload, &RecordMeta) + Send + Sync>;

/// Invoked once per path, on first sighting, strictly before any record for
/// that path.
pub type SightingCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Receives the aggregated failure message at termination, when at least one
/// worker failed.
pub type ExceptionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Metadata accompanying every record.
#[derive(Debug, Clone)]
pub struct RecordMeta {
    /// Absolute path of the file the record came from.
    pub file_name: PathBuf,
    /// Wall-clock time of record emission, seconds since the epoch.
    pub timestamp: f64,
    /// Parser-supplied extras.
    pub extras: Payload,
}

/// Options that affect monitoring, constant for the lifetime of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Poll period for every worker.
    pub interval: Duration,
    /// Terminate this long after `run`, if set.
    pub timeout: Option<Duration>,
    /// Serialize every callback in the session through one mutex.
    pub lock_callbacks: bool,
    /// Collapse nested payload mappings with `.` before filtering.
    pub flatten_data: bool,
    /// Request global termination as soon as any worker fails.
    pub terminate_all_on_failure: bool,
    /// Cap on simultaneously live file workers per discipline; `None` is
    /// unbounded.
    pub file_limit: Option<usize>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            interval: Duration::from_millis(100),
            timeout: None,
            lock_callbacks: false,
            flatten_data: false,
            terminate_all_on_failure: false,
            file_limit: Some(50),
        }
    }
}

/// A snapshot observation request: re-parse the whole file on every change.
pub struct TrackRequest {
    /// Glob patterns selecting the files to watch.
    pub globs: Vec<String>,
    /// Tracked-values filter; empty passes payloads through unchanged.
    pub tracked: Vec<Tracked>,
    /// Positional labels for `tracked`; empty means no overrides.  When
    /// non-empty the length must match `tracked`.
    pub labels: Vec<Option<String>>,
    /// Per-request record sink, overriding the session callback.
    pub callback: Option<RecordCallback>,
    /// Custom parser, taking precedence over suffix dispatch.
    pub parser: Option<Arc<dyn SnapshotParser>>,
    /// Static keyword arguments handed to every parser invocation.
    pub parser_args: Payload,
    /// Terminate the file worker after one successful read.
    pub static_read: bool,
    /// Force a built-in format, ignoring the file suffix.
    pub file_type: Option<FileFormat>,
}

impl Default for TrackRequest {
    fn default() -> Self {
        TrackRequest {
            globs: Vec::new(),
            tracked: Vec::new(),
            labels: Vec::new(),
            callback: None,
            parser: None,
            parser_args: Payload::new(),
            static_read: false,
            file_type: None,
        }
    }
}

/// An incremental observation request: parse only appended bytes.
pub struct TailRequest {
    /// Glob patterns selecting the files to watch.
    pub globs: Vec<String>,
    /// Tracked-values filter; empty passes payloads through unchanged.
    pub tracked: Vec<Tracked>,
    /// Positional labels for `tracked`; empty means no overrides.
    pub labels: Vec<Option<String>>,
    /// Per-request record sink, overriding the session callback.
    pub callback: Option<RecordCallback>,
    /// Custom delta parser; the plain line parser is used otherwise.
    pub parser: Option<Arc<dyn DeltaParser>>,
    /// Static keyword arguments handed to every parser invocation.
    pub parser_args: Payload,
    /// Complete lines matching any of these are dropped before parsing.
    pub skip_lines: Vec<SkipPattern>,
}

impl Default for TailRequest {
    fn default() -> Self {
        TailRequest {
            globs: Vec::new(),
            tracked: Vec::new(),
            labels: Vec::new(),
            callback: None,
            parser: None,
            parser_args: Payload::new(),
            skip_lines: Vec::new(),
        }
    }
}

/// Observation discipline of a validated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Discipline {
    Snapshot,
    Incremental,
}

/// A validated observation request, immutable after registration.
pub(crate) struct Request {
    pub discipline: Discipline,
    pub globs: Vec<String>,
    pub tracked: Vec<(Tracked, Option<String>)>,
    pub callback: Option<RecordCallback>,
    pub snapshot_parser: Option<Arc<dyn SnapshotParser>>,
    pub delta_parser: Option<Arc<dyn DeltaParser>>,
    pub parser_args: Payload,
    pub static_read: bool,
    pub file_type: Option<FileFormat>,
    pub skip_lines: Vec<SkipPattern>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("discipline", &self.discipline)
            .field("globs", &self.globs)
            .field("tracked", &self.tracked)
            .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
            .field(
                "snapshot_parser",
                &self.snapshot_parser.as_ref().map(|_| "<snapshot_parser>"),
            )
            .field(
                "delta_parser",
                &self.delta_parser.as_ref().map(|_| "<delta_parser>"),
            )
            .field("parser_args", &self.parser_args)
            .field("static_read", &self.static_read)
            .field("file_type", &self.file_type)
            .field("skip_lines", &self.skip_lines)
            .finish()
    }
}

/// Pair tracked values with their labels and enforce the co-constraints.
fn pair_tracked(
    tracked: Vec<Tracked>,
    labels: Vec<Option<String>>,
) -> Result<Vec<(Tracked, Option<String>)>, ConfigError> {
    if !labels.is_empty() && labels.len() != tracked.len() {
        return Err(ConfigError::LabelCount {
            tracked: tracked.len(),
            labels: labels.len(),
        });
    }
    let pairs: Vec<(Tracked, Option<String>)> = tracked
        .into_iter()
        .zip_longest(labels)
        .map(|both| match both {
            EitherOrBoth::Both(entry, label) => (entry, label),
            EitherOrBoth::Left(entry) => (entry, None),
            EitherOrBoth::Right(_) => unreachable!("labels length checked above"),
        })
        .collect();
    for (position, (entry, label)) in pairs.iter().enumerate() {
        match entry.capture_groups() {
            Some(1) => {
                if label.is_none() {
                    return Err(ConfigError::MissingLabel(position));
                }
            }
            Some(2) | None => {}
            Some(groups) => {
                return Err(ConfigError::CaptureCount { position, groups });
            }
        }
    }
    Ok(pairs)
}

fn check_globs(globs: &[String]) -> Result<(), ConfigError> {
    if globs.is_empty() {
        return Err(ConfigError::EmptyGlobs);
    }
    Ok(())
}

impl TrackRequest {
    pub(crate) fn validate(self) -> Result<Request, ConfigError> {
        check_globs(&self.globs)?;
        Ok(Request {
            discipline: Discipline::Snapshot,
            globs: self.globs,
            tracked: pair_tracked(self.tracked, self.labels)?,
            callback: self.callback,
            snapshot_parser: self.parser,
            delta_parser: None,
            parser_args: self.parser_args,
            static_read: self.static_read,
            file_type: self.file_type,
            skip_lines: Vec::new(),
        })
    }
}

impl TailRequest {
    pub(crate) fn validate(self) -> Result<Request, ConfigError> {
        check_globs(&self.globs)?;
        Ok(Request {
            discipline: Discipline::Incremental,
            globs: self.globs,
            tracked: pair_tracked(self.tracked, self.labels)?,
            callback: self.callback,
            snapshot_parser: None,
            delta_parser: self.parser,
            parser_args: self.parser_args,
            static_read: false,
            file_type: None,
            skip_lines: self.skip_lines,
        })
    }
}
