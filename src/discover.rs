//! Discovery workers: one per observation request.
//!
//! Each discovery worker periodically expands its request's glob patterns,
//! drops matches hit by an exclusion pattern or already owned within the
//! discipline, and spawns a file worker for everything that remains, subject
//! to the per-discipline cap on live workers.  Candidates refused by the cap
//! are simply retried on a later tick; fairness is iteration order.
//!
//! Ownership is hierarchical: a discovery worker joins every file worker it
//! spawned before returning, so the supervisor's join of the discovery
//! threads transitively joins the whole worker tree.

use crate::diag::{WorkerError, WorkerKind};
use crate::monitor::Shared;
use crate::request::Request;
use crate::worker::{panic_text, FileWorker};
use fnv::FnvHashSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Outcome of trying to claim a path for a new file worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    /// The path is now owned by the caller; spawn a worker for it.
    Claimed,
    /// A worker (live or terminated) already owns this path.
    Owned,
    /// The live-worker cap is reached; retry on a later tick.
    Deferred,
}

/// Per-discipline registry of owned paths and the live-worker count.
///
/// Owned paths are never forgotten (a terminated worker's path must not be
/// re-claimed), while the live count shrinks as workers finish, freeing cap
/// slots.
#[derive(Debug)]
pub(crate) struct Ownership {
    owned: Mutex<FnvHashSet<PathBuf>>,
    live: AtomicUsize,
    limit: Option<usize>,
}

impl Ownership {
    pub fn new(limit: Option<usize>) -> Ownership {
        Ownership {
            owned: Mutex::new(FnvHashSet::default()),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn claim(&self, path: &Path) -> Claim {
        let mut owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
        if owned.contains(path) {
            return Claim::Owned;
        }
        if let Some(limit) = self.limit {
            if self.live.load(Ordering::Acquire) >= limit {
                return Claim::Deferred;
            }
        }
        owned.insert(path.to_owned());
        self.live.fetch_add(1, Ordering::AcqRel);
        Claim::Claimed
    }

    /// Called by a file worker as it exits; frees one cap slot.
    pub fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// The worker expanding one request's glob patterns.
pub(crate) struct DiscoveryWorker {
    pub request: Arc<Request>,
    pub shared: Arc<Shared>,
}

impl DiscoveryWorker {
    fn source(&self) -> String {
        self.request.globs.join(" ")
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let name = format!("discover {}", self.source());
        thread::Builder::new().name(name).spawn(move || self.run())
    }

    fn run(&self) {
        let mut children = Vec::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.watch(&mut children)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => self.shared.fail(WorkerKind::Discovery, self.source(), &error),
            Err(payload) => {
                let error = WorkerError::Panic(panic_text(payload.as_ref()));
                self.shared.fail(WorkerKind::Discovery, self.source(), &error);
            }
        }
        // The failure above is stored before this join, so escalation under
        // terminate_all_on_failure can still release the children.
        for child in children {
            if child.join().is_err() {
                log::error!("file worker thread panicked past its own handler");
            }
        }
    }

    fn watch(&self, children: &mut Vec<JoinHandle<()>>) -> Result<(), WorkerError> {
        loop {
            if self.shared.stop.is_set() {
                return Ok(());
            }
            let mut deferred = false;
            for pattern in &self.request.globs {
                let matches =
                    glob::glob(pattern).map_err(|e| WorkerError::Pattern(e.to_string()))?;
                for entry in matches {
                    let path = entry.map_err(|e| WorkerError::Pattern(e.to_string()))?;
                    if !path.is_file() || self.shared.excluded(&path) {
                        continue;
                    }
                    // The match may vanish between expansion and here.
                    let Ok(canonical) = path.canonicalize() else {
                        continue;
                    };
                    let ownership = self.shared.ownership(self.request.discipline);
                    match ownership.claim(&canonical) {
                        Claim::Owned => {}
                        Claim::Deferred => deferred = true,
                        Claim::Claimed => {
                            log::debug!("found new file {}", canonical.display());
                            let worker = FileWorker {
                                path: canonical,
                                request: Arc::clone(&self.request),
                                shared: Arc::clone(&self.shared),
                            };
                            match worker.spawn() {
                                Ok(handle) => children.push(handle),
                                Err(error) => {
                                    ownership.release();
                                    return Err(WorkerError::Io(error));
                                }
                            }
                        }
                    }
                }
            }
            // A static request is exhausted once an expansion left nothing
            // unspawned and every spawned worker has completed its read.
            if self.request.static_read
                && !deferred
                && children.iter().all(JoinHandle::is_finished)
            {
                log::debug!("static request {} exhausted", self.source());
                return Ok(());
            }
            if self.shared.stop.sleep(self.shared.options.interval) {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_is_idempotent_and_capped() {
        let ownership = Ownership::new(Some(2));
        assert_eq!(ownership.claim(Path::new("/tmp/a")), Claim::Claimed);
        assert_eq!(ownership.claim(Path::new("/tmp/a")), Claim::Owned);
        assert_eq!(ownership.claim(Path::new("/tmp/b")), Claim::Claimed);
        assert_eq!(ownership.claim(Path::new("/tmp/c")), Claim::Deferred);
        assert_eq!(ownership.live(), 2);

        // A finished worker frees a cap slot but its path stays owned.
        ownership.release();
        assert_eq!(ownership.claim(Path::new("/tmp/a")), Claim::Owned);
        assert_eq!(ownership.claim(Path::new("/tmp/c")), Claim::Claimed);
    }

    #[test]
    fn unlimited_ownership_never_defers() {
        let ownership = Ownership::new(None);
        for index in 0..100 {
            let path = format!("/tmp/file-{index}");
            assert_eq!(ownership.claim(Path::new(&path)), Claim::Claimed);
        }
    }
}
