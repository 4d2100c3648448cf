//! Per-file workers and the coordination primitives they share.
//!
//! Every watched file is owned by exactly one worker thread which polls the
//! file's metadata on the session interval and reacts when the last-modified
//! timestamp advances.  Snapshot workers re-parse the whole file; incremental
//! workers keep a byte offset and a pending-fragment buffer so that every
//! complete appended line is parsed exactly once, in file-byte order, across
//! the worker's lifetime.  Truncation and rotation restart the offset at
//! zero, discarding the pending fragment whose content is no longer
//! authoritative.
//!
//! Cancellation is cooperative: workers sleep on a condition variable which
//! the supervisor signals, so the worst-case latency to stop is one poll
//! interval plus whatever parser or callback invocation is in flight.

use crate::diag::{WorkerError, WorkerKind};
use crate::extract::extract;
use crate::monitor::Shared;
use crate::parser::{self, DeltaParser, Payload, PlainLines, SnapshotParser};
use crate::request::{Discipline, RecordMeta, Request};
use filetime::FileTime;
use std::any::Any;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// A set-once termination signal workers sleep against.
///
/// `sleep` doubles as the poll-interval wait: it returns early, reporting
/// `true`, as soon as the signal fires, so a triggered session never waits a
/// full interval to wind down.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    state: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    /// Set the signal and wake every sleeper.  Idempotent.
    pub fn trigger(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = true;
        self.wake.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `interval` or until the signal fires, whichever comes first.
    /// Returns `true` when the signal is set.
    pub fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
        true
    }
}

/// Serializes user callbacks through one session-wide mutex when
/// `lock_callbacks` is set, and converts callback panics into worker errors.
/// The mutex is released whether or not the callback panics.
#[derive(Debug)]
pub(crate) struct CallbackGate {
    lock: Option<Mutex<()>>,
}

impl CallbackGate {
    pub fn new(serialize: bool) -> CallbackGate {
        CallbackGate {
            lock: serialize.then(|| Mutex::new(())),
        }
    }

    pub fn invoke<F: FnOnce()>(&self, callback: F) -> Result<(), WorkerError> {
        let _guard = self
            .lock
            .as_ref()
            .map(|mutex| mutex.lock().unwrap_or_else(|e| e.into_inner()));
        panic::catch_unwind(AssertUnwindSafe(callback))
            .map_err(|payload| WorkerError::Callback(panic_text(payload.as_ref())))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Seconds since the epoch, as stamped into record metadata.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

/// Stable identity of an open file, used to notice rotation even when the
/// replacement is larger than the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    device: u64,
    #[cfg(unix)]
    inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> FileIdentity {
        use std::os::unix::fs::MetadataExt;
        FileIdentity {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(_meta: &fs::Metadata) -> FileIdentity {
        FileIdentity {}
    }
}

/// Read the byte range `[from, to)` of `path`.
fn read_range(path: &Path, from: u64, to: u64) -> io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut delta = Vec::with_capacity((to - from) as usize);
    file.take(to - from).read_to_end(&mut delta)?;
    Ok(delta)
}

/// The worker owning one watched file.
pub(crate) struct FileWorker {
    pub path: PathBuf,
    pub request: Arc<Request>,
    pub shared: Arc<Shared>,
}

impl FileWorker {
    fn kind(&self) -> WorkerKind {
        match self.request.discipline {
            Discipline::Snapshot => WorkerKind::Snapshot,
            Discipline::Incremental => WorkerKind::Incremental,
        }
    }

    /// Spawn the worker thread.  The thread stores its own failure, if any,
    /// and releases its slot in the per-discipline live count on exit.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let name = format!("{} {}", self.kind(), self.path.display());
        thread::Builder::new().name(name).spawn(move || {
            let kind = self.kind();
            let source = self.path.display().to_string();
            let discipline = self.request.discipline;
            let shared = Arc::clone(&self.shared);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => shared.fail(kind, source, &error),
                Err(payload) => {
                    let error = WorkerError::Panic(panic_text(payload.as_ref()));
                    shared.fail(kind, source, &error);
                }
            }
            shared.ownership(discipline).release();
        })
    }

    fn run(&self) -> Result<(), WorkerError> {
        match self.request.discipline {
            Discipline::Snapshot => self.run_snapshot(),
            Discipline::Incremental => self.run_tail(),
        }
    }

    /// Resolve the snapshot parser: file-type override, then the custom
    /// handle, then suffix dispatch.
    fn resolve_parser(&self) -> Result<&dyn SnapshotParser, WorkerError> {
        if let Some(format) = self.request.file_type {
            return Ok(format.parser());
        }
        if let Some(custom) = &self.request.snapshot_parser {
            return Ok(custom.as_ref());
        }
        parser::for_path(&self.path)
            .ok_or_else(|| WorkerError::NoParser(self.path.display().to_string()))
    }

    /// Announce the first sighting of this worker's path.  Goes through the
    /// gate so that under `lock_callbacks` a sighting never overlaps any
    /// other callback in the session.
    fn sight(&self) -> Result<(), WorkerError> {
        self.shared
            .gate
            .invoke(|| (self.shared.sighting_callback)(&self.path))
    }

    /// Filter one payload and hand the surviving record to the callback.
    /// The literal-line fallback for string entries applies to tailed
    /// payloads only.
    fn deliver(&self, payload: &Payload, extras: &Payload) -> Result<(), WorkerError> {
        let Some(data) = extract(
            payload,
            &self.request.tracked,
            self.shared.options.flatten_data,
            self.request.discipline == Discipline::Incremental,
        ) else {
            return Ok(());
        };
        let Some(callback) = self
            .request
            .callback
            .as_ref()
            .or(self.shared.record_callback.as_ref())
        else {
            return Ok(());
        };
        let meta = RecordMeta {
            file_name: self.path.clone(),
            timestamp: epoch_seconds(),
            extras: extras.clone(),
        };
        self.shared.gate.invoke(|| callback(&data, &meta))
    }

    fn run_snapshot(&self) -> Result<(), WorkerError> {
        let parser = self.resolve_parser()?;
        self.sight()?;
        let mut last_seen: Option<FileTime> = None;
        while !self.shared.stop.is_set() {
            match fs::metadata(&self.path) {
                // The path disappeared after discovery; stay idle, not failed.
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(WorkerError::Io(error)),
                Ok(meta) => {
                    let mtime = FileTime::from_last_modification_time(&meta);
                    if last_seen.map_or(true, |seen| mtime > seen) {
                        let parsed = parser.parse_file(&self.path, &self.request.parser_args)?;
                        self.deliver(&parsed.data, &parsed.extras)?;
                        last_seen = Some(mtime);
                        if self.request.static_read {
                            log::debug!("{} read once, worker done", self.path.display());
                            return Ok(());
                        }
                    }
                }
            }
            if self.shared.stop.sleep(self.shared.options.interval) {
                break;
            }
        }
        Ok(())
    }

    fn run_tail(&self) -> Result<(), WorkerError> {
        self.sight()?;
        let parser: &dyn DeltaParser = match &self.request.delta_parser {
            Some(custom) => custom.as_ref(),
            None => &PlainLines,
        };
        let mut offset: u64 = 0;
        let mut pending = String::new();
        let mut last_seen: Option<FileTime> = None;
        let mut identity: Option<FileIdentity> = None;
        while !self.shared.stop.is_set() {
            match fs::metadata(&self.path) {
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(WorkerError::Io(error)),
                Ok(meta) => {
                    let size = meta.len();
                    let mtime = FileTime::from_last_modification_time(&meta);
                    let current = FileIdentity::of(&meta);
                    let rotated = identity.map_or(false, |known| known != current);
                    identity = Some(current);
                    let fresh = last_seen.map_or(true, |seen| mtime > seen);
                    if fresh || size < offset || rotated {
                        self.tail_tick(parser, &mut offset, &mut pending, size, rotated)?;
                        last_seen = Some(mtime);
                    }
                }
            }
            if self.shared.stop.sleep(self.shared.options.interval) {
                break;
            }
        }
        Ok(())
    }

    /// One incremental tick: handle truncation, read the delta, split off
    /// complete lines, and parse what survives the skip patterns.
    fn tail_tick(
        &self,
        parser: &dyn DeltaParser,
        offset: &mut u64,
        pending: &mut String,
        size: u64,
        rotated: bool,
    ) -> Result<(), WorkerError> {
        if rotated || size < *offset {
            // Reopened or truncated: bytes before the cut are no longer
            // authoritative, and neither is the buffered fragment.
            log::debug!(
                "{} truncated or rotated, restarting from byte 0",
                self.path.display()
            );
            *offset = 0;
            pending.clear();
        }
        if size > *offset {
            let delta = read_range(&self.path, *offset, size)?;
            *offset = size;
            pending.push_str(&String::from_utf8_lossy(&delta));
        }
        // Only newline-terminated lines are parsed this tick; the unfinished
        // fragment stays buffered so each complete line is seen exactly once.
        let Some(cut) = pending.rfind('\n') else {
            return Ok(());
        };
        let block: String = pending.drain(..=cut).collect();
        let kept: Vec<&str> = block
            .lines()
            .filter(|line| {
                !self
                    .request
                    .skip_lines
                    .iter()
                    .any(|pattern| pattern.is_match(line))
            })
            .collect();
        if kept.is_empty() {
            return Ok(());
        }
        let parsed = parser.parse_delta(&kept.join("\n"), &self.request.parser_args)?;
        for payload in &parsed.payloads {
            self.deliver(payload, &parsed.extras)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_wakes_sleepers() {
        let signal = Arc::new(StopSignal::new());
        assert!(!signal.is_set());
        assert!(!signal.sleep(Duration::from_millis(5)));

        let sleeper = Arc::clone(&signal);
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let started = Instant::now();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(signal.is_set());
        // Triggered signals never sleep.
        assert!(signal.sleep(Duration::from_secs(60)));
    }

    #[test]
    fn gate_reports_callback_panics_and_stays_usable() {
        let gate = CallbackGate::new(true);
        let result = gate.invoke(|| panic!("user code broke"));
        match result {
            Err(WorkerError::Callback(message)) => assert!(message.contains("user code broke")),
            other => panic!("expected a callback failure, got {other:?}"),
        }
        // The serialization mutex was released by the panicking invocation.
        assert!(gate.invoke(|| ()).is_ok());
    }

    #[test]
    fn read_range_returns_the_requested_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.log");
        fs::write(&path, b"0123456789").unwrap();
        assert_eq!(read_range(&path, 4, 8).unwrap(), b"4567");
        assert_eq!(read_range(&path, 0, 0).unwrap(), b"");
    }
}
