//! The monitoring session: supervisor thread and public façade.
//!
//! A `FileMonitor` is configured once, accepts any number of track/tail
//! requests, and is then started with [`FileMonitor::run`], which launches one
//! discovery worker per request plus a supervisor thread and returns
//! immediately.  The supervisor owns the termination policy: it watches the
//! external trigger, the timeout, the failure registry (under
//! `terminate_all_on_failure`) and natural completion, and on any cause it
//! signals every worker, joins the whole tree, sets the downstream triggers,
//! and folds stored failures into one aggregated error.
//!
//! [`FileMonitor::join`] surfaces that aggregate to the caller.  Dropping the
//! monitor guarantees termination and the join, but can only log the
//! aggregate; call `join` to observe it.

use crate::diag::{ConfigError, FailureRegistry, MonitorError, WorkerError, WorkerFailure, WorkerKind};
use crate::discover::{DiscoveryWorker, Ownership};
use crate::parser::Payload;
use crate::request::{
    Discipline, ExceptionCallback, MonitorOptions, RecordCallback, RecordMeta, Request,
    SightingCallback, TailRequest, TrackRequest,
};
use crate::worker::{CallbackGate, StopSignal};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Lifecycle of a monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Accepting requests; no worker exists yet.
    Configured,
    /// Workers are live.
    Running,
    /// Termination requested; workers are being joined.
    Stopping,
    /// All workers joined, downstream triggers set.  Terminal.
    Stopped,
}

/// State shared between the façade, the supervisor, and every worker.
pub(crate) struct Shared {
    pub options: MonitorOptions,
    pub record_callback: Option<RecordCallback>,
    pub sighting_callback: SightingCallback,
    pub exception_callback: Option<ExceptionCallback>,
    pub termination_trigger: Option<Arc<AtomicBool>>,
    pub downstream_triggers: Vec<Arc<AtomicBool>>,
    pub stop: Arc<StopSignal>,
    pub gate: CallbackGate,
    pub failures: FailureRegistry,
    pub exclusions: Arc<Mutex<Vec<glob::Pattern>>>,
    pub snapshot_files: Ownership,
    pub incremental_files: Ownership,
    pub state: Arc<Mutex<State>>,
}

impl Shared {
    pub fn ownership(&self, discipline: Discipline) -> &Ownership {
        match discipline {
            Discipline::Snapshot => &self.snapshot_files,
            Discipline::Incremental => &self.incremental_files,
        }
    }

    pub fn excluded(&self, path: &Path) -> bool {
        self.exclusions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|pattern| pattern.matches_path(path))
    }

    /// Store one worker's failure and escalate when the policy says so.
    pub fn fail(&self, kind: WorkerKind, source: String, error: &WorkerError) {
        self.failures.store(WorkerFailure {
            kind,
            source,
            message: error.to_string(),
        });
        if self.options.terminate_all_on_failure {
            self.stop.trigger();
        }
    }
}

/// A scoped monitoring session.
///
/// Construction takes the immutable options; callbacks and triggers are
/// attached with the `with_*` builders before any request is registered.
/// After `run`, registration fails and the session can only be observed,
/// terminated, and joined.
pub struct FileMonitor {
    options: MonitorOptions,
    record_callback: Option<RecordCallback>,
    sighting_callback: SightingCallback,
    exception_callback: Option<ExceptionCallback>,
    termination_trigger: Option<Arc<AtomicBool>>,
    downstream_triggers: Vec<Arc<AtomicBool>>,
    exclusions: Arc<Mutex<Vec<glob::Pattern>>>,
    requests: Vec<Arc<Request>>,
    stop: Arc<StopSignal>,
    state: Arc<Mutex<State>>,
    shared: Option<Arc<Shared>>,
    supervisor: Option<JoinHandle<()>>,
}

impl FileMonitor {
    /// A monitor with no requests and the default sighting logger.
    #[must_use]
    pub fn new(options: MonitorOptions) -> FileMonitor {
        FileMonitor {
            options,
            record_callback: None,
            sighting_callback: Arc::new(|path: &Path| {
                log::info!("now monitoring {}", path.display());
            }),
            exception_callback: None,
            termination_trigger: None,
            downstream_triggers: Vec::new(),
            exclusions: Arc::new(Mutex::new(Vec::new())),
            requests: Vec::new(),
            stop: Arc::new(StopSignal::new()),
            state: Arc::new(Mutex::new(State::Configured)),
            shared: None,
            supervisor: None,
        }
    }

    /// Default record sink for requests without their own callback.
    #[must_use]
    pub fn with_record_callback<F>(mut self, callback: F) -> FileMonitor
    where
        F: Fn(&Payload, &RecordMeta) + Send + Sync + 'static,
    {
        self.record_callback = Some(Arc::new(callback));
        self
    }

    /// Invoked once per path on first sighting, replacing the default logger.
    #[must_use]
    pub fn with_sighting_callback<F>(mut self, callback: F) -> FileMonitor
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        self.sighting_callback = Arc::new(callback);
        self
    }

    /// Receives the aggregated failure message at termination, when at least
    /// one worker failed.
    #[must_use]
    pub fn with_exception_callback<F>(mut self, callback: F) -> FileMonitor
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.exception_callback = Some(Arc::new(callback));
        self
    }

    /// External set-once flag; the session terminates soon after it is set.
    #[must_use]
    pub fn with_termination_trigger(mut self, trigger: Arc<AtomicBool>) -> FileMonitor {
        self.termination_trigger = Some(trigger);
        self
    }

    /// A downstream set-once flag, set strictly after every worker has
    /// joined.  May be called repeatedly to register several.
    #[must_use]
    pub fn with_downstream_trigger(mut self, trigger: Arc<AtomicBool>) -> FileMonitor {
        self.downstream_triggers.push(trigger);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a snapshot observation request.
    pub fn track(&mut self, request: TrackRequest) -> Result<(), MonitorError> {
        let validated = request.validate()?;
        self.register(validated)
    }

    /// Register an incremental observation request.
    pub fn tail(&mut self, request: TailRequest) -> Result<(), MonitorError> {
        let validated = request.validate()?;
        self.register(validated)
    }

    fn register(&mut self, request: Request) -> Result<(), MonitorError> {
        if self.state() != State::Configured {
            return Err(ConfigError::AlreadyRunning.into());
        }
        for existing in &self.requests {
            if existing.discipline != request.discipline {
                if let Some(pattern) = request
                    .globs
                    .iter()
                    .find(|pattern| existing.globs.contains(*pattern))
                {
                    return Err(ConfigError::DisciplineClash(pattern.clone()).into());
                }
            }
        }
        self.requests.push(Arc::new(request));
        Ok(())
    }

    /// Exclude paths matching `pattern` from future discovery.  Workers
    /// already spawned for matching paths are not stopped.
    pub fn exclude(&self, pattern: &str) -> Result<(), MonitorError> {
        let compiled = glob::Pattern::new(pattern).map_err(ConfigError::from)?;
        self.exclusions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(compiled);
        Ok(())
    }

    /// Start monitoring: one discovery worker per registered request plus the
    /// supervisor.  Returns immediately.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        if self.state() != State::Configured {
            return Err(ConfigError::AlreadyRunning.into());
        }
        let shared = Arc::new(Shared {
            options: self.options.clone(),
            record_callback: self.record_callback.clone(),
            sighting_callback: Arc::clone(&self.sighting_callback),
            exception_callback: self.exception_callback.clone(),
            termination_trigger: self.termination_trigger.clone(),
            downstream_triggers: self.downstream_triggers.clone(),
            stop: Arc::clone(&self.stop),
            gate: CallbackGate::new(self.options.lock_callbacks),
            failures: FailureRegistry::default(),
            exclusions: Arc::clone(&self.exclusions),
            snapshot_files: Ownership::new(self.options.file_limit),
            incremental_files: Ownership::new(self.options.file_limit),
            state: Arc::clone(&self.state),
        });
        self.shared = Some(Arc::clone(&shared));

        let mut discoverers = Vec::with_capacity(self.requests.len());
        for request in &self.requests {
            let worker = DiscoveryWorker {
                request: Arc::clone(request),
                shared: Arc::clone(&shared),
            };
            let source = request.globs.join(" ");
            match worker.spawn() {
                Ok(handle) => discoverers.push(handle),
                Err(error) => {
                    shared.fail(WorkerKind::Discovery, source, &WorkerError::Io(error));
                }
            }
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = State::Running;
        match thread::Builder::new()
            .name("monitor supervisor".to_owned())
            .spawn(move || supervise(&shared, discoverers))
        {
            Ok(handle) => {
                self.supervisor = Some(handle);
                Ok(())
            }
            Err(error) => {
                // Without a supervisor nothing would ever join the workers;
                // unwind the launch on the caller's thread instead.
                self.stop.trigger();
                let shared = self.shared.as_ref().map(Arc::clone);
                if let Some(shared) = shared {
                    supervise(&shared, Vec::new());
                }
                Err(MonitorError::Workers(vec![WorkerFailure {
                    kind: WorkerKind::Supervisor,
                    source: "monitor".to_owned(),
                    message: error.to_string(),
                }]))
            }
        }
    }

    /// Request termination (cause: explicit user).  Safe to call at any time
    /// and from any thread holding a reference.
    pub fn terminate(&self) {
        self.stop.trigger();
    }

    /// Wait for the session to stop and surface the aggregated failures, if
    /// any.  Blocks until a termination cause fires.
    pub fn join(&mut self) -> Result<(), MonitorError> {
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                log::error!("monitor supervisor panicked");
            }
        }
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        let failures = shared.failures.snapshot();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Workers(failures))
        }
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop.trigger();
        match self.join() {
            Ok(()) => {}
            Err(error) => log::error!("{error}"),
        }
    }
}

/// The supervisor loop: decide when to stop, then wind everything down in
/// order: signal, join, downstream triggers, exception callback.
fn supervise(shared: &Arc<Shared>, discoverers: Vec<JoinHandle<()>>) {
    let started = Instant::now();
    loop {
        if shared.stop.is_set() {
            log::debug!("monitor stopping: termination requested");
            break;
        }
        if shared
            .termination_trigger
            .as_ref()
            .map_or(false, |trigger| trigger.load(Ordering::Acquire))
        {
            log::debug!("monitor stopping: external trigger set");
            break;
        }
        if shared
            .options
            .timeout
            .map_or(false, |timeout| started.elapsed() >= timeout)
        {
            log::info!("monitor stopping: timeout elapsed");
            break;
        }
        if shared.options.terminate_all_on_failure && !shared.failures.is_empty() {
            log::debug!("monitor stopping: worker failure with terminate_all_on_failure");
            break;
        }
        // Vacuously true with no requests; otherwise only static discovery
        // workers ever finish on their own.
        if discoverers.iter().all(JoinHandle::is_finished) {
            log::debug!("monitor stopping: all requests complete");
            break;
        }
        if shared.stop.sleep(shared.options.interval) {
            break;
        }
    }

    *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = State::Stopping;
    shared.stop.trigger();
    for discoverer in discoverers {
        if discoverer.join().is_err() {
            log::error!("discovery worker thread panicked past its own handler");
        }
    }

    // Strictly after every worker has joined.
    for trigger in &shared.downstream_triggers {
        trigger.store(true, Ordering::Release);
    }

    let failures = shared.failures.snapshot();
    if !failures.is_empty() {
        if let Some(callback) = &shared.exception_callback {
            let message = MonitorError::aggregate(&failures);
            if shared.gate.invoke(|| callback(&message)).is_err() {
                log::error!("exception callback panicked");
            }
        }
    }

    *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = State::Stopped;
}
