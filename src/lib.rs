//! Parallel, polling observation of changing data files.
//!
//! A [`FileMonitor`] is given any number of *track* and *tail* requests, each
//! selecting files by glob pattern.  Once running, every matching file is
//! owned by its own worker thread which polls the file's last-modified
//! timestamp; when it advances, the file is parsed and the extracted
//! key-value records are delivered to a callback.  Tracked files are
//! re-parsed in full on every change (suited to structured documents that are
//! rewritten); tailed files are read incrementally, parsing only the bytes
//! appended since the previous read (suited to append-only logs).
//!
//! ## Observation model
//!
//! Discovery is periodic: one discovery worker per request expands its globs
//! every poll interval and spawns a file worker for each newly-seen match not
//! hit by an exclusion pattern, up to a per-discipline cap on live workers.
//! Change detection is polling on modification times, never OS event
//! notification; this keeps behavior deterministic under load and portable
//! across filesystems.  Tail workers keep a byte offset and survive file
//! truncation and rotation by restarting from byte zero (content before the
//! cut is advertised as lossy).
//!
//! Records pass through a tracked-values filter before delivery: exact keys,
//! single-capture patterns harvested under a mandatory label, or two-capture
//! patterns where the first group names the value.  Nested payloads can be
//! flattened with `.`-joined keys.
//!
//! Workers fail independently.  A failed worker stores its failure and
//! terminates; the session keeps running (or stops at once under
//! `terminate_all_on_failure`) and the failures are folded into a single
//! aggregated error surfaced by [`FileMonitor::join`].
//!
//! ## Example
//!
//! ```no_run
//! use multiwatch::{FileMonitor, MonitorOptions, TailRequest, Tracked};
//! use regex::Regex;
//!
//! # fn main() -> Result<(), multiwatch::MonitorError> {
//! let mut monitor = FileMonitor::new(MonitorOptions::default())
//!     .with_record_callback(|data, meta| {
//!         println!("{}: {:?}", meta.file_name.display(), data);
//!     });
//! monitor.tail(TailRequest {
//!     globs: vec!["run/*.log".to_owned()],
//!     tracked: vec![Tracked::pattern(Regex::new(r"(\w+)=(\d+)").unwrap())],
//!     ..TailRequest::default()
//! })?;
//! monitor.run()?;
//! // ... do other work; records arrive on worker threads ...
//! monitor.terminate();
//! monitor.join()?;
//! # Ok(())
//! # }
//! ```

pub mod diag;
mod discover;
pub mod extract;
pub mod monitor;
pub mod parser;
pub mod request;
mod worker;


pub use diag::{ConfigError, MonitorError, WorkerFailure, WorkerKind};
pub use extract::{flatten, SkipPattern, Tracked};
pub use monitor::{FileMonitor, State};
pub use parser::{
    DeltaParsed, DeltaParser, FileFormat, ParseError, Parsed, Payload, PlainLines, SnapshotParser,
};
pub use request::{
    ExceptionCallback, MonitorOptions, RecordCallback, RecordMeta, SightingCallback, TailRequest,
    TrackRequest,
};
