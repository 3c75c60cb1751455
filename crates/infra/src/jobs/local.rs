//! Single-process job system backed by the filesystem.
//!
//! State lives in memory behind one mutex; every record is mirrored to
//! `<root>/<ticket>/job.json` with write-to-temp-then-rename so an interrupted
//! process never leaves a torn file behind. Reopening the same root rebuilds
//! the queue from those files. One process owns a root at a time, enforced
//! with an exclusive lock on `<root>/msaq.lock`.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use msaq_core::{Fingerprint, JobRequest, Ticket};

use super::store::{JobSystem, JobSystemError};
use super::types::{ClaimedJob, JobRecord, JobState, StatusUpdate};

/// File name of the persisted record inside a job's work directory.
pub const RECORD_FILE: &str = "job.json";

/// Lock file taken by the process that owns a root.
pub const LOCK_FILE: &str = "msaq.lock";

/// Message recorded for jobs found `Running` when a root is reopened.
pub const INTERRUPTED_MESSAGE: &str = "interrupted before completion";

#[derive(Default)]
struct LocalState {
    records: HashMap<Ticket, JobRecord>,
    by_fingerprint: HashMap<Fingerprint, Ticket>,
    pending: VecDeque<Ticket>,
}

/// Local job system.
///
/// Share one instance between the server and all worker threads via `Arc`.
pub struct LocalJobSystem {
    root: PathBuf,
    state: Mutex<LocalState>,
    available: Condvar,
    // released when dropped
    _owner: File,
}

impl std::fmt::Debug for LocalJobSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalJobSystem")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl LocalJobSystem {
    /// Open (or create) a job system rooted at `root`.
    ///
    /// Fails if another live instance holds the root. Existing
    /// `root/*/job.json` records are loaded: pending jobs are re-queued
    /// oldest first, jobs left `Running` by a dead process are marked `Error`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JobSystemError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| storage(&root, e))?;
        let owner = take_ownership(&root)?;

        let state = recover(&root)?;
        info!(
            root = %root.display(),
            records = state.records.len(),
            pending = state.pending.len(),
            "local job system opened"
        );

        Ok(Self {
            root,
            state: Mutex::new(state),
            available: Condvar::new(),
            _owner: owner,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of jobs waiting to be claimed.
    pub fn pending_count(&self) -> Result<usize, JobSystemError> {
        Ok(self.lock()?.pending.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, LocalState>, JobSystemError> {
        self.state
            .lock()
            .map_err(|_| JobSystemError::Storage("lock poisoned".to_string()))
    }

    /// Flip a pending job to `Running`. `None` if it is not pending.
    fn start(&self, state: &mut LocalState, ticket: Ticket) -> Result<Option<ClaimedJob>, JobSystemError> {
        let Some(record) = state.records.get(&ticket) else {
            return Ok(None);
        };
        if record.state != JobState::Pending {
            return Ok(None);
        }

        let mut claimed = record.clone();
        claimed
            .apply(StatusUpdate::running())
            .map_err(|edge| JobSystemError::transition(ticket, edge))?;
        persist(&self.root, &claimed)?;

        let job = claimed.claimed();
        state.records.insert(ticket, claimed);
        debug!(%ticket, "job claimed");
        Ok(Some(job))
    }
}

impl JobSystem for LocalJobSystem {
    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint()), err)]
    fn submit(
        &self,
        request: &JobRequest,
        results_dir: &Path,
        force: bool,
    ) -> Result<Ticket, JobSystemError> {
        let mut state = self.lock()?;

        if !force {
            if let Some(existing) = state.by_fingerprint.get(request.fingerprint()) {
                if let Some(record) = state.records.get(existing) {
                    if record.state != JobState::Error {
                        debug!(ticket = %existing, state = %record.state, "duplicate submission");
                        return Ok(*existing);
                    }
                }
            }
        }

        let ticket = Ticket::new();
        let record = JobRecord::new(
            ticket,
            request.clone(),
            results_dir.join(ticket.to_string()),
        );
        persist(&self.root, &record)?;

        state
            .by_fingerprint
            .insert(request.fingerprint().clone(), ticket);
        state.records.insert(ticket, record);
        state.pending.push_back(ticket);
        drop(state);

        self.available.notify_one();
        info!(%ticket, "job submitted");
        Ok(ticket)
    }

    fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, JobSystemError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            while let Some(ticket) = state.pending.pop_front() {
                match self.start(&mut state, ticket) {
                    Ok(Some(job)) => return Ok(Some(job)),
                    Ok(None) => continue,
                    Err(e) => {
                        state.pending.push_front(ticket);
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| JobSystemError::Storage("lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn claim_ticket(&self, ticket: Ticket) -> Result<Option<ClaimedJob>, JobSystemError> {
        let mut state = self.lock()?;
        if !state.records.contains_key(&ticket) {
            return Err(JobSystemError::NotFound(ticket));
        }
        let Some(at) = state.pending.iter().position(|t| *t == ticket) else {
            return Ok(None);
        };

        state.pending.remove(at);
        self.start(&mut state, ticket).inspect_err(|_| state.pending.insert(at, ticket))
    }

    #[instrument(skip(self, update), fields(state = %update.state()), err)]
    fn update_status(&self, ticket: Ticket, update: StatusUpdate) -> Result<(), JobSystemError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get(&ticket)
            .ok_or(JobSystemError::NotFound(ticket))?;

        let mut updated = record.clone();
        updated
            .apply(update)
            .map_err(|edge| JobSystemError::transition(ticket, edge))?;
        persist(&self.root, &updated)?;

        info!(%ticket, state = %updated.state, "job status updated");
        state.records.insert(ticket, updated);
        Ok(())
    }

    fn record(&self, ticket: Ticket) -> Result<JobRecord, JobSystemError> {
        self.lock()?
            .records
            .get(&ticket)
            .cloned()
            .ok_or(JobSystemError::NotFound(ticket))
    }
}

fn storage(path: &Path, e: impl std::fmt::Display) -> JobSystemError {
    JobSystemError::Storage(format!("{}: {}", path.display(), e))
}

/// Exclusive lock on `root`, held for the life of the job system.
fn take_ownership(root: &Path) -> Result<File, JobSystemError> {
    let path = root.join(LOCK_FILE);
    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| storage(&path, e))?;

    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(storage(root, "in use by another process")),
        Err(TryLockError::Error(e)) => Err(storage(&path, e)),
    }
}

/// Atomically write `record` to `<root>/<ticket>/job.json`. The record lives
/// under the root even when its work directory is elsewhere.
fn persist(root: &Path, record: &JobRecord) -> Result<(), JobSystemError> {
    let dir = root.join(record.ticket.to_string());
    let dir = dir.as_path();
    fs::create_dir_all(dir).map_err(|e| storage(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| storage(dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, record).map_err(|e| storage(dir, e))?;
    tmp.flush().map_err(|e| storage(dir, e))?;

    let target = dir.join(RECORD_FILE);
    tmp.persist(&target).map_err(|e| storage(&target, e.error))?;
    Ok(())
}

fn recover(root: &Path) -> Result<LocalState, JobSystemError> {
    let mut loaded = Vec::new();

    for entry in fs::read_dir(root).map_err(|e| storage(root, e))? {
        let path = match entry {
            Ok(entry) => entry.path().join(RECORD_FILE),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "unreadable directory entry");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<JobRecord>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(record) => loaded.push(record),
            Err(error) => warn!(path = %path.display(), %error, "skipping unreadable job record"),
        }
    }

    loaded.sort_by_key(|r| r.created_at);

    let mut state = LocalState::default();
    for mut record in loaded {
        match record.state {
            JobState::Running => {
                record
                    .apply(StatusUpdate::error(INTERRUPTED_MESSAGE))
                    .map_err(|edge| JobSystemError::transition(record.ticket, edge))?;
                persist(root, &record)?;
                warn!(ticket = %record.ticket, "job was running at shutdown, marked as error");
            }
            JobState::Pending => state.pending.push_back(record.ticket),
            JobState::Complete | JobState::Error => {}
        }

        if record.state != JobState::Error {
            state
                .by_fingerprint
                .insert(record.request.fingerprint().clone(), record.ticket);
        }
        state.records.insert(record.ticket, record);
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::jobs::store::contract;

    fn open(dir: &tempfile::TempDir) -> LocalJobSystem {
        LocalJobSystem::open(dir.path()).unwrap()
    }

    #[test]
    fn submit_then_pending() {
        let dir = tempfile::tempdir().unwrap();
        contract::submit_then_pending(&open(&dir), dir.path());
    }

    #[test]
    fn duplicate_submit_reuses_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = open(&dir);
        contract::duplicate_submit_reuses_ticket(&jobs, dir.path());
    }

    #[test]
    fn errored_job_does_not_absorb_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        contract::errored_job_does_not_absorb_resubmission(&open(&dir), dir.path());
    }

    #[test]
    fn full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        contract::full_lifecycle(&open(&dir), dir.path());
    }

    #[test]
    fn transitions_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        contract::transitions_are_enforced(&open(&dir), dir.path());
    }

    #[test]
    fn claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        contract::claim_is_exclusive(Arc::new(open(&dir)), dir.path());
    }

    #[test]
    fn claim_ticket_takes_only_that_job() {
        let dir = tempfile::tempdir().unwrap();
        contract::claim_ticket_takes_only_that_job(&open(&dir), dir.path());
    }

    #[test]
    fn empty_claim_times_out() {
        let dir = tempfile::tempdir().unwrap();
        contract::empty_claim_times_out(&open(&dir));
    }

    #[test]
    fn record_is_mirrored_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = open(&dir);
        let ticket = jobs
            .submit(&contract::request("ABCDEF"), dir.path(), false)
            .unwrap();

        let path = dir.path().join(ticket.to_string()).join(RECORD_FILE);
        let on_disk: JobRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.ticket, ticket);
        assert_eq!(on_disk.state, JobState::Pending);
    }

    #[test]
    fn waiting_claimant_is_woken_by_submit() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(open(&dir));

        let waiter = {
            let jobs = Arc::clone(&jobs);
            thread::spawn(move || jobs.claim(Duration::from_secs(5)).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let ticket = jobs
            .submit(&contract::request("ABCDEF"), dir.path(), false)
            .unwrap();

        let claimed = waiter.join().unwrap().unwrap();
        assert_eq!(claimed.ticket, ticket);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn reopen_recovers_pending_and_fails_running() {
        let dir = tempfile::tempdir().unwrap();
        let (running, pending) = {
            let jobs = open(&dir);
            let running = jobs
                .submit(&contract::request("AAAA"), dir.path(), false)
                .unwrap();
            let pending = jobs
                .submit(&contract::request("CCCC"), dir.path(), false)
                .unwrap();
            assert_eq!(
                jobs.claim(Duration::ZERO).unwrap().unwrap().ticket,
                running
            );
            (running, pending)
        };

        let jobs = open(&dir);
        assert_eq!(jobs.pending_count().unwrap(), 1);

        let record = jobs.record(running).unwrap();
        assert_eq!(record.state, JobState::Error);
        assert_eq!(record.message.as_deref(), Some(INTERRUPTED_MESSAGE));

        // the pending job still deduplicates and can be claimed
        assert_eq!(
            jobs.submit(&contract::request("CCCC"), dir.path(), false)
                .unwrap(),
            pending
        );
        assert_eq!(jobs.claim(Duration::ZERO).unwrap().unwrap().ticket, pending);

        // the interrupted job may be submitted again
        assert_ne!(
            jobs.submit(&contract::request("AAAA"), dir.path(), false)
                .unwrap(),
            running
        );
    }

    #[test]
    fn corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(RECORD_FILE), "{ not json").unwrap();
        fs::write(dir.path().join("stray.txt"), "x").unwrap();

        let jobs = open(&dir);
        assert_eq!(jobs.pending_count().unwrap(), 0);
    }

    #[test]
    fn record_outside_root_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let ticket = {
            let jobs = open(&dir);
            jobs.submit(&contract::request("ABCDEF"), elsewhere.path(), false)
                .unwrap()
        };
        assert!(dir.path().join(ticket.to_string()).join(RECORD_FILE).is_file());

        let jobs = open(&dir);
        let record = jobs.record(ticket).unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.work_dir, elsewhere.path().join(ticket.to_string()));
        assert_eq!(jobs.claim(Duration::ZERO).unwrap().unwrap().ticket, ticket);
    }

    #[test]
    fn root_is_owned_by_one_instance() {
        let dir = tempfile::tempdir().unwrap();
        let ticket = {
            let first = open(&dir);
            let ticket = first
                .submit(&contract::request("ABCDEF"), dir.path(), false)
                .unwrap();
            first.claim(Duration::ZERO).unwrap().unwrap();

            let err = LocalJobSystem::open(dir.path()).unwrap_err();
            assert!(matches!(err, JobSystemError::Storage(ref m) if m.contains("in use")));
            // the live instance's running job was left alone
            assert_eq!(first.status(ticket).unwrap(), JobState::Running);
            ticket
        };

        let reopened = open(&dir);
        assert_eq!(reopened.status(ticket).unwrap(), JobState::Error);
    }
}
