//! Job system abstraction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use msaq_core::{JobRequest, Ticket};

use super::types::{ClaimedJob, JobRecord, JobState, StatusUpdate};

/// Queue and state store for search jobs.
///
/// Both backends implement the same observable semantics:
///
/// - `submit` deduplicates on the request fingerprint unless `force` is set;
///   a job in `Error` never absorbs a resubmission.
/// - `claim` and `claim_ticket` hand each pending job to exactly one caller,
///   flipping it to `Running` in the same atomic step.
/// - `update_status` enforces the lifecycle DAG.
///
/// Every method is safe to call concurrently.
pub trait JobSystem: Send + Sync {
    /// Enqueue `request`, or return the ticket of an equivalent live job.
    ///
    /// New jobs get the work directory `results_dir/<ticket>`.
    fn submit(
        &self,
        request: &JobRequest,
        results_dir: &Path,
        force: bool,
    ) -> Result<Ticket, JobSystemError>;

    /// Claim the next pending job, waiting up to `wait` for one to appear.
    /// Returns `None` if nothing became available.
    fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, JobSystemError>;

    /// Claim one specific job if it is still pending, without waiting.
    /// Returns `None` if it was claimed already or has settled.
    fn claim_ticket(&self, ticket: Ticket) -> Result<Option<ClaimedJob>, JobSystemError>;

    /// Move a job along the lifecycle.
    fn update_status(&self, ticket: Ticket, update: StatusUpdate) -> Result<(), JobSystemError>;

    /// Full record, for diagnostics.
    fn record(&self, ticket: Ticket) -> Result<JobRecord, JobSystemError>;

    /// Current lifecycle state.
    fn status(&self, ticket: Ticket) -> Result<JobState, JobSystemError> {
        Ok(self.record(ticket)?.state)
    }

    /// Result location of a completed job.
    fn result(&self, ticket: Ticket) -> Result<PathBuf, JobSystemError> {
        let record = self.record(ticket)?;
        match (record.state, record.result_location) {
            (JobState::Complete, Some(location)) => Ok(location),
            (state, _) => Err(JobSystemError::NotReady { ticket, state }),
        }
    }
}

impl<S> JobSystem for Arc<S>
where
    S: JobSystem + ?Sized,
{
    fn submit(
        &self,
        request: &JobRequest,
        results_dir: &Path,
        force: bool,
    ) -> Result<Ticket, JobSystemError> {
        (**self).submit(request, results_dir, force)
    }

    fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, JobSystemError> {
        (**self).claim(wait)
    }

    fn claim_ticket(&self, ticket: Ticket) -> Result<Option<ClaimedJob>, JobSystemError> {
        (**self).claim_ticket(ticket)
    }

    fn update_status(&self, ticket: Ticket, update: StatusUpdate) -> Result<(), JobSystemError> {
        (**self).update_status(ticket, update)
    }

    fn record(&self, ticket: Ticket) -> Result<JobRecord, JobSystemError> {
        (**self).record(ticket)
    }

    fn status(&self, ticket: Ticket) -> Result<JobState, JobSystemError> {
        (**self).status(ticket)
    }

    fn result(&self, ticket: Ticket) -> Result<PathBuf, JobSystemError> {
        (**self).result(ticket)
    }
}

/// Job system error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobSystemError {
    #[error("job not found: {0}")]
    NotFound(Ticket),
    #[error("invalid transition for job {ticket}: {from} -> {to}")]
    InvalidTransition {
        ticket: Ticket,
        from: JobState,
        to: JobState,
    },
    #[error("job {ticket} is not ready (state: {state})")]
    NotReady { ticket: Ticket, state: JobState },
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobSystemError {
    /// Transient connectivity failure; the caller may back off and retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobSystemError::StoreUnavailable(_))
    }

    pub(crate) fn transition(ticket: Ticket, (from, to): (JobState, JobState)) -> Self {
        Self::InvalidTransition { ticket, from, to }
    }
}
