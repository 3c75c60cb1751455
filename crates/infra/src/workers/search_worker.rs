use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use msaq_core::Ticket;

use crate::engine::SearchEngine;
use crate::jobs::types::sleep_unless_cancelled;
use crate::jobs::{ClaimedJob, JobSystem, JobSystemError, RetryPolicy, StatusUpdate};

/// Search worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the thread name
    pub name: String,
    /// How long one claim waits for a job
    pub poll_interval: Duration,
    /// Backoff applied while the job store is unreachable
    pub store_backoff: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "search-worker".to_string(),
            poll_interval: Duration::from_millis(500),
            store_backoff: RetryPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(10),
            ),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_store_backoff(mut self, policy: RetryPolicy) -> Self {
        self.store_backoff = policy;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub store_errors: u64,
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { ticket: Ticket, location: PathBuf },
    Failed { ticket: Ticket, message: String },
}

impl JobOutcome {
    pub fn ticket(&self) -> Ticket {
        match self {
            JobOutcome::Completed { ticket, .. } | JobOutcome::Failed { ticket, .. } => *ticket,
        }
    }
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A job in flight is interrupted and recorded as failed.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        self.wait();
    }

    /// Wait for the worker to stop on its own (its token was cancelled).
    pub fn join(mut self) {
        self.wait();
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        snapshot(&self.stats)
    }

    fn wait(&mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("search worker thread panicked");
            }
        }
    }
}

/// Claims jobs from a [`JobSystem`] and runs them through a [`SearchEngine`].
///
/// One iteration handles one job: claim, run, record the outcome. Failures
/// are recorded on the job and never stop the loop; store outages are backed
/// off and retried.
pub struct SearchWorker<S, E: ?Sized> {
    jobs: S,
    engine: Arc<E>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, E> SearchWorker<S, E>
where
    S: JobSystem,
    E: SearchEngine + ?Sized,
{
    pub fn new(jobs: S, engine: Arc<E>, config: WorkerConfig) -> Self {
        Self {
            jobs,
            engine,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        snapshot(&self.stats)
    }

    /// Spawn the worker loop on a named thread. It runs until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> std::io::Result<WorkerHandle>
    where
        S: 'static,
        E: 'static,
    {
        let stats = Arc::clone(&self.stats);
        let token = cancel.clone();
        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || worker_loop(self, token))?;

        Ok(WorkerHandle {
            cancel,
            join: Some(join),
            stats,
        })
    }

    /// Claim and process at most one job.
    ///
    /// Returns `Ok(None)` when nothing was pending within the poll window.
    /// Errors are job-store failures; engine failures are outcomes.
    pub fn run_once(&self, cancel: &CancellationToken) -> Result<Option<JobOutcome>, JobSystemError> {
        match self.jobs.claim(self.config.poll_interval)? {
            Some(job) => self.process(job, cancel).map(Some),
            None => Ok(None),
        }
    }

    /// Claim and process `ticket` only, leaving the rest of the queue alone.
    ///
    /// Returns `Ok(None)` when the job is no longer pending.
    pub fn run_ticket(
        &self,
        ticket: Ticket,
        cancel: &CancellationToken,
    ) -> Result<Option<JobOutcome>, JobSystemError> {
        match self.jobs.claim_ticket(ticket)? {
            Some(job) => self.process(job, cancel).map(Some),
            None => Ok(None),
        }
    }

    fn process(&self, job: ClaimedJob, cancel: &CancellationToken) -> Result<JobOutcome, JobSystemError> {
        let name = &self.config.name;
        info!(worker = %name, ticket = %job.ticket, "job started");

        let outcome = match self.execute(&job, cancel) {
            Ok(location) => JobOutcome::Completed {
                ticket: job.ticket,
                location,
            },
            Err(message) => JobOutcome::Failed {
                ticket: job.ticket,
                message,
            },
        };

        let update = match &outcome {
            JobOutcome::Completed { location, .. } => StatusUpdate::complete(location),
            JobOutcome::Failed { message, .. } => StatusUpdate::error(message.as_str()),
        };
        self.record(job.ticket, update, cancel)?;

        self.bump(|s| {
            s.jobs_processed += 1;
            match &outcome {
                JobOutcome::Completed { .. } => s.jobs_succeeded += 1,
                JobOutcome::Failed { .. } => s.jobs_failed += 1,
            }
        });

        match &outcome {
            JobOutcome::Completed { location, .. } => {
                info!(worker = %name, ticket = %job.ticket, location = %location.display(), "job complete")
            }
            JobOutcome::Failed { message, .. } => {
                warn!(worker = %name, ticket = %job.ticket, error = %message, "job failed")
            }
        }

        Ok(outcome)
    }

    /// Run the engine and place its artifact. The error is the diagnostic to
    /// record on the job.
    fn execute(&self, job: &ClaimedJob, cancel: &CancellationToken) -> Result<PathBuf, String> {
        let run = panic::catch_unwind(AssertUnwindSafe(|| self.engine.run(job, cancel)));
        let artifact = match run {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err("search engine panicked".to_string()),
        };

        place_artifact(&artifact, &job.work_dir)
            .map_err(|e| format!("failed to store result {}: {}", artifact.display(), e))
    }

    /// Record an outcome, retrying for as long as the store is unavailable.
    ///
    /// Only `cancel` ends the retries early; the job stays `Running` then.
    fn record(
        &self,
        ticket: Ticket,
        update: StatusUpdate,
        cancel: &CancellationToken,
    ) -> Result<(), JobSystemError> {
        let policy = &self.config.store_backoff;
        let mut attempt: u32 = 0;

        loop {
            match self.jobs.update_status(ticket, update.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_unavailable() => {
                    attempt = attempt.saturating_add(1);
                    self.bump(|s| s.store_errors += 1);
                    warn!(worker = %self.config.name, %ticket, attempt, error = %e, "failed to record outcome, retrying");
                    if !policy.wait(attempt, cancel) {
                        error!(worker = %self.config.name, %ticket, "gave up recording outcome on shutdown");
                        return Err(e);
                    }
                }
                // an earlier attempt landed before the connection dropped
                Err(JobSystemError::InvalidTransition { from, .. })
                    if attempt > 0 && from == update.state() =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        match self.stats.lock() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

fn snapshot(stats: &Mutex<WorkerStats>) -> WorkerStats {
    match stats.lock() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Keep `artifact` if it already lives in `work_dir`, otherwise copy it in.
fn place_artifact(artifact: &Path, work_dir: &Path) -> std::io::Result<PathBuf> {
    let resolved = fs::canonicalize(artifact)?;
    let root = fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf());
    if resolved.starts_with(&root) {
        return Ok(artifact.to_path_buf());
    }

    let name = artifact
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "artifact has no file name"))?;
    fs::create_dir_all(work_dir)?;
    let target = work_dir.join(name);
    fs::copy(&resolved, &target)?;
    debug!(from = %resolved.display(), to = %target.display(), "artifact copied into work directory");
    Ok(target)
}

fn worker_loop<S, E>(worker: SearchWorker<S, E>, cancel: CancellationToken)
where
    S: JobSystem,
    E: SearchEngine + ?Sized,
{
    let name = worker.config.name.clone();
    info!(worker = %name, "search worker started");
    let mut store_failures: u32 = 0;

    while !cancel.is_cancelled() {
        match worker.run_once(&cancel) {
            Ok(_) => store_failures = 0,
            Err(e) => {
                store_failures = store_failures.saturating_add(1);
                worker.bump(|s| s.store_errors += 1);
                let delay = worker
                    .config
                    .store_backoff
                    .delay_for_attempt(store_failures)
                    .max(worker.config.poll_interval);
                error!(worker = %name, error = %e, delay_ms = delay.as_millis() as u64, "job store error");
                sleep_unless_cancelled(delay, &cancel);
            }
        }
    }

    info!(worker = %name, stats = ?worker.stats(), "search worker stopped");
}
