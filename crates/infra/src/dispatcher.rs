//! Submission and query service shared by the HTTP adapter and the CLI.
//!
//! Validation happens before the job system is touched, so a rejected
//! submission never leaves a record behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use msaq_core::{DatabaseCatalog, JobRequest, RequestError, SearchPayload, Ticket};

use crate::jobs::{JobRecord, JobState, JobSystem, JobSystemError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Jobs(#[from] JobSystemError),
}

impl DispatchError {
    /// Caused by the caller (bad input, unknown or unfinished ticket) rather
    /// than by the service.
    pub fn is_user_error(&self) -> bool {
        match self {
            DispatchError::Request(_) => true,
            DispatchError::Jobs(e) => matches!(
                e,
                JobSystemError::NotFound(_) | JobSystemError::NotReady { .. }
            ),
        }
    }
}

/// Front door of the job system.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<dyn JobSystem>,
    catalog: Arc<dyn DatabaseCatalog>,
    results_dir: PathBuf,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("results_dir", &self.results_dir)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobSystem>,
        catalog: Arc<dyn DatabaseCatalog>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            jobs,
            catalog,
            results_dir: results_dir.into(),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobSystem> {
        &self.jobs
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Validate a raw payload and enqueue it.
    #[instrument(skip(self, payload), fields(mode = %payload.mode), err)]
    pub fn submit(&self, payload: &SearchPayload, force: bool) -> Result<Ticket, DispatchError> {
        let request = JobRequest::resolve(payload, &*self.catalog)?;
        self.submit_request(&request, force)
    }

    /// Enqueue an already validated request.
    pub fn submit_request(&self, request: &JobRequest, force: bool) -> Result<Ticket, DispatchError> {
        let ticket = self.jobs.submit(request, &self.results_dir, force)?;
        debug!(%ticket, kind = request.variant().tag(), "submission accepted");
        Ok(ticket)
    }

    pub fn status(&self, ticket: Ticket) -> Result<JobState, DispatchError> {
        Ok(self.jobs.status(ticket)?)
    }

    pub fn record(&self, ticket: Ticket) -> Result<JobRecord, DispatchError> {
        Ok(self.jobs.record(ticket)?)
    }

    /// Records for many tickets; unknown tickets map to `None`.
    pub fn records(&self, tickets: &[Ticket]) -> Result<Vec<(Ticket, Option<JobRecord>)>, DispatchError> {
        tickets
            .iter()
            .map(|&ticket| match self.jobs.record(ticket) {
                Ok(record) => Ok((ticket, Some(record))),
                Err(JobSystemError::NotFound(_)) => Ok((ticket, None)),
                Err(e) => Err(e.into()),
            })
            .collect()
    }

    pub fn result(&self, ticket: Ticket) -> Result<PathBuf, DispatchError> {
        Ok(self.jobs.result(ticket)?)
    }

    /// Catalog database ids.
    pub fn databases(&self) -> Vec<String> {
        self.catalog.ids()
    }

    /// Poll until `ticket` reaches a terminal state.
    ///
    /// Returns `None` if `cancel` fires first.
    pub fn wait_for_terminal(
        &self,
        ticket: Ticket,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRecord>, DispatchError> {
        loop {
            let record = self.jobs.record(ticket)?;
            if record.state.is_terminal() {
                return Ok(Some(record));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }
            thread::sleep(poll);
        }
    }
}
