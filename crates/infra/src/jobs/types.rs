//! Job record types and policies.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use msaq_core::{JobRequest, Ticket};

/// Lifecycle state of a job.
///
/// Transitions form a DAG: `Pending -> Running -> {Complete, Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Finished, result location recorded
    Complete,
    /// Failed, diagnostic message recorded
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }

    /// Whether `self -> next` is an edge of the lifecycle DAG.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        next.predecessor() == Some(*self)
    }

    /// The only state a job may be in right before entering `self`.
    pub fn predecessor(&self) -> Option<JobState> {
        match self {
            JobState::Pending => None,
            JobState::Running => Some(JobState::Pending),
            JobState::Complete | JobState::Error => Some(JobState::Running),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Error => "error",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "complete" => Ok(JobState::Complete),
            "error" => Ok(JobState::Error),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A requested state change, validated by the job system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    state: JobState,
    result_location: Option<PathBuf>,
    message: Option<String>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            result_location: None,
            message: None,
        }
    }

    pub fn complete(location: impl Into<PathBuf>) -> Self {
        Self {
            state: JobState::Complete,
            result_location: Some(location.into()),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Error,
            result_location: None,
            message: Some(message.into()),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn result_location(&self) -> Option<&Path> {
        self.result_location.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Persistent job record owned by a job system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub ticket: Ticket,
    pub state: JobState,
    pub request: JobRequest,
    pub work_dir: PathBuf,
    /// Set only when `Complete`
    pub result_location: Option<PathBuf>,
    /// Set only when `Error`
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new pending record.
    pub fn new(ticket: Ticket, request: JobRequest, work_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            ticket,
            state: JobState::Pending,
            request,
            work_dir,
            result_location: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether `update` may be applied to this record.
    ///
    /// Returns the rejected edge on failure. `Complete` without a location is
    /// rejected as well.
    pub fn check(&self, update: &StatusUpdate) -> Result<(), (JobState, JobState)> {
        let next = update.state();
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        if next == JobState::Complete && update.result_location().is_none() {
            return Err((self.state, next));
        }
        Ok(())
    }

    /// Apply a validated update.
    pub fn apply(&mut self, update: StatusUpdate) -> Result<(), (JobState, JobState)> {
        self.check(&update)?;
        self.state = update.state;
        self.result_location = update.result_location;
        self.message = update.message;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn claimed(&self) -> ClaimedJob {
        ClaimedJob {
            ticket: self.ticket,
            request: self.request.clone(),
            work_dir: self.work_dir.clone(),
        }
    }
}

/// A job handed to exactly one worker by `claim`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub ticket: Ticket,
    pub request: JobRequest,
    pub work_dir: PathBuf,
}

/// Backoff for transient job-store failures.
///
/// Delays double from `base_delay` and stop growing at `max_delay`; a policy
/// with equal bounds waits the same time on every attempt. `max_attempts`
/// caps calls that may give up, such as submissions. Recording a job's
/// outcome never gives up and only stops when it is cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(200), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::exponential(max_attempts, delay, delay)
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(20);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Sleep before retry number `attempt`. Returns `false` if `cancel`
    /// fired first.
    pub fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        sleep_unless_cancelled(self.delay_for_attempt(attempt), cancel)
    }
}

/// Sleep in short ticks so cancellation is noticed promptly. Returns `false`
/// if `cancel` fired.
pub(crate) fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    let tick = Duration::from_millis(50);
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(tick);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}
