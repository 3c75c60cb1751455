//! Redis-backed job system shared by workers on many machines.
//!
//! ## Layout
//!
//! - **Job hash**: `<prefix>:job:<ticket>` with fields `ticket`, `state`,
//!   `request` (JSON), `work_dir`, `result`, `message`, `created_at`,
//!   `updated_at`
//! - **Fingerprint index**: `<prefix>:fp:<fingerprint>` holding a ticket
//! - **Queue**: `<prefix>:pending`, a list of pending tickets
//! - **Claiming**: `<prefix>:claiming`, tickets moved off the queue whose
//!   flip to `running` has not landed yet
//!
//! Submission and every state change run as Lua scripts so the check and the
//! write happen atomically on the server. Claiming moves a ticket from the
//! queue to the claiming list with `BLMOVE`, so exactly one client receives
//! it, then a script flips it to `running` and drops it from that list. A
//! ticket stranded in the claiming list by a crashed client stays `pending`
//! and is put back by [`RedisJobSystem::requeue_stranded`].
//!
//! Needs Redis 6.2 or newer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{RedisError, Script};
use tracing::{debug, info, instrument, warn};

use msaq_core::{JobRequest, Ticket};

use super::store::{JobSystem, JobSystemError};
use super::types::{ClaimedJob, JobRecord, JobState, RetryPolicy, StatusUpdate};

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "msaq";

/// KEYS: fingerprint, pending list, job hash, claiming list.
/// ARGV: ticket, force flag, request JSON, work dir, timestamp, job key prefix.
///
/// A reused `pending` ticket that sits in neither list is queued again.
const SUBMIT_SCRIPT: &str = r#"
if ARGV[2] == '0' then
  local existing = redis.call('GET', KEYS[1])
  if existing then
    local state = redis.call('HGET', ARGV[6] .. existing, 'state')
    if state and state ~= 'error' then
      if state == 'pending'
        and not redis.call('LPOS', KEYS[2], existing)
        and not redis.call('LPOS', KEYS[4], existing) then
        redis.call('RPUSH', KEYS[2], existing)
      end
      return existing
    end
  end
end
if redis.call('EXISTS', KEYS[3]) == 1 then
  return ARGV[1]
end
redis.call('HSET', KEYS[3],
  'ticket', ARGV[1],
  'state', 'pending',
  'request', ARGV[3],
  'work_dir', ARGV[4],
  'created_at', ARGV[5],
  'updated_at', ARGV[5])
redis.call('SET', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
return ARGV[1]
"#;

/// KEYS: job hash.
/// ARGV: expected state, new state, result, message, timestamp.
///
/// Returns `{0, ''}` for a missing job, `{1, current}` when the expected
/// state does not match, `{2, previous}` on success.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'state')
if not current then
  return {0, ''}
end
if current ~= ARGV[1] then
  return {1, current}
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'updated_at', ARGV[5])
if ARGV[3] ~= '' then
  redis.call('HSET', KEYS[1], 'result', ARGV[3])
end
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[1], 'message', ARGV[4])
end
return {2, current}
"#;

/// KEYS: job hash, list the ticket is taken from.
/// ARGV: ticket, timestamp.
///
/// Same codes as the transition script; on success the third element is the
/// job hash after the flip.
const CLAIM_SCRIPT: &str = r#"
redis.call('LREM', KEYS[2], 1, ARGV[1])
local current = redis.call('HGET', KEYS[1], 'state')
if not current then
  return {0, '', {}}
end
if current ~= 'pending' then
  return {1, current, {}}
end
redis.call('HSET', KEYS[1], 'state', 'running', 'updated_at', ARGV[2])
return {2, current, redis.call('HGETALL', KEYS[1])}
"#;

/// KEYS: claiming list, pending list.
/// ARGV: job key prefix.
///
/// Returns how many tickets went back to the queue.
const REQUEUE_SCRIPT: &str = r#"
local moved = 0
for _, ticket in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  redis.call('LREM', KEYS[1], 1, ticket)
  if redis.call('HGET', ARGV[1] .. ticket, 'state') == 'pending' then
    redis.call('LPUSH', KEYS[2], ticket)
    moved = moved + 1
  end
end
return moved
"#;

const TRANSITION_MISSING: i64 = 0;
const TRANSITION_CONFLICT: i64 = 1;

/// Distributed job system.
#[derive(Debug, Clone)]
pub struct RedisJobSystem {
    client: Arc<redis::Client>,
    prefix: String,
    retry: RetryPolicy,
    submit_script: Arc<Script>,
    transition_script: Arc<Script>,
    claim_script: Arc<Script>,
    requeue_script: Arc<Script>,
}

impl RedisJobSystem {
    /// Create a job system for `redis_url`.
    ///
    /// No connection is made until the first call. `prefix` defaults to
    /// [`DEFAULT_PREFIX`].
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, JobSystemError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| JobSystemError::Storage(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            retry: RetryPolicy::default(),
            submit_script: Arc::new(Script::new(SUBMIT_SCRIPT)),
            transition_script: Arc::new(Script::new(TRANSITION_SCRIPT)),
            claim_script: Arc::new(Script::new(CLAIM_SCRIPT)),
            requeue_script: Arc::new(Script::new(REQUEUE_SCRIPT)),
        })
    }

    /// Replace the policy used for transient connectivity failures.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Round trip to the server.
    pub fn ping(&self) -> Result<(), JobSystemError> {
        let _: String = self.with_retry("ping", |conn| redis::cmd("PING").query(conn))?;
        Ok(())
    }

    /// Return tickets stranded in the claiming list to the queue.
    ///
    /// Safe to run while workers are claiming: a ticket returned twice is
    /// still flipped to `running` only once.
    pub fn requeue_stranded(&self) -> Result<usize, JobSystemError> {
        let claiming = self.claiming_key();
        let pending = self.pending_key();
        let job_key_prefix = self.job_key_prefix();

        let moved: usize = self.with_retry("requeue", |conn| {
            self.requeue_script
                .key(&claiming)
                .key(&pending)
                .arg(&job_key_prefix)
                .invoke(conn)
        })?;
        if moved > 0 {
            info!(moved, "stranded tickets returned to the queue");
        }
        Ok(moved)
    }

    fn job_key_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn job_key(&self, ticket: Ticket) -> String {
        format!("{}:job:{}", self.prefix, ticket)
    }

    fn fingerprint_key(&self, request: &JobRequest) -> String {
        format!("{}:fp:{}", self.prefix, request.fingerprint())
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn claiming_key(&self) -> String {
        format!("{}:claiming", self.prefix)
    }

    /// Run `f` on a fresh connection, retrying transient failures per the
    /// retry policy. Exhausting the policy yields `StoreUnavailable`.
    fn with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, JobSystemError> {
        let mut attempt = 0;
        loop {
            let result = self
                .client
                .get_connection()
                .and_then(|mut conn| f(&mut conn));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && self.retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "redis call failed, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(e) if is_transient(&e) => {
                    return Err(JobSystemError::StoreUnavailable(format!("{op}: {e}")));
                }
                Err(e) => return Err(JobSystemError::Storage(format!("{op}: {e}"))),
            }
        }
    }

    /// Compare-and-set `ticket` from `from` to the update's state.
    fn transition(
        &self,
        ticket: Ticket,
        from: JobState,
        update: &StatusUpdate,
    ) -> Result<(), JobSystemError> {
        let key = self.job_key(ticket);
        let result = update
            .result_location()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let message = update.message().unwrap_or_default().to_string();
        let now = Utc::now().to_rfc3339();

        let (code, current): (i64, String) = self.with_retry("transition", |conn| {
            self.transition_script
                .key(&key)
                .arg(from.as_str())
                .arg(update.state().as_str())
                .arg(&result)
                .arg(&message)
                .arg(&now)
                .invoke(conn)
        })?;

        match code {
            TRANSITION_MISSING => Err(JobSystemError::NotFound(ticket)),
            TRANSITION_CONFLICT => Err(JobSystemError::InvalidTransition {
                ticket,
                from: parse_state(&current)?,
                to: update.state(),
            }),
            _ => Ok(()),
        }
    }

    /// Drop `ticket` from `list` and flip it to `Running`, in one script.
    /// `None` if the job is no longer pending.
    fn start(&self, ticket: Ticket, list: &str) -> Result<Option<ClaimedJob>, JobSystemError> {
        let key = self.job_key(ticket);
        let now = Utc::now().to_rfc3339();

        let (code, current, flat): (i64, String, Vec<String>) = self.with_retry("claim", |conn| {
            self.claim_script
                .key(&key)
                .key(list)
                .arg(ticket.to_string())
                .arg(&now)
                .invoke(conn)
        })?;

        match code {
            TRANSITION_MISSING => Err(JobSystemError::NotFound(ticket)),
            TRANSITION_CONFLICT => {
                debug!(%ticket, state = %current, "ticket is not pending");
                Ok(None)
            }
            _ => {
                let fields: HashMap<String, String> = flat
                    .chunks_exact(2)
                    .map(|kv| (kv[0].clone(), kv[1].clone()))
                    .collect();
                debug!(%ticket, "job claimed");
                Ok(Some(decode_record(ticket, &fields)?.claimed()))
            }
        }
    }
}

impl JobSystem for RedisJobSystem {
    #[instrument(skip(self, request), fields(prefix = %self.prefix, fingerprint = %request.fingerprint()), err)]
    fn submit(
        &self,
        request: &JobRequest,
        results_dir: &Path,
        force: bool,
    ) -> Result<Ticket, JobSystemError> {
        let ticket = Ticket::new();
        let payload = serde_json::to_string(request)
            .map_err(|e| JobSystemError::Storage(format!("serialize request: {e}")))?;
        let work_dir = results_dir.join(ticket.to_string());
        let work_dir = work_dir.to_string_lossy().into_owned();
        let now = Utc::now().to_rfc3339();

        let fp_key = self.fingerprint_key(request);
        let pending_key = self.pending_key();
        let claiming_key = self.claiming_key();
        let job_key = self.job_key(ticket);
        let job_key_prefix = self.job_key_prefix();

        let returned: String = self.with_retry("submit", |conn| {
            self.submit_script
                .key(&fp_key)
                .key(&pending_key)
                .key(&job_key)
                .key(&claiming_key)
                .arg(ticket.to_string())
                .arg(if force { "1" } else { "0" })
                .arg(&payload)
                .arg(&work_dir)
                .arg(&now)
                .arg(&job_key_prefix)
                .invoke(conn)
        })?;

        let returned: Ticket = returned
            .parse()
            .map_err(|e| JobSystemError::Storage(format!("submit returned {returned:?}: {e}")))?;
        if returned == ticket {
            info!(%ticket, "job submitted");
        } else {
            debug!(ticket = %returned, "duplicate submission");
        }
        Ok(returned)
    }

    fn claim(&self, wait: Duration) -> Result<Option<ClaimedJob>, JobSystemError> {
        // BLMOVE takes whole seconds here and treats 0 as "forever"
        let timeout = wait.as_secs().max(1);
        let pending = self.pending_key();
        let claiming = self.claiming_key();

        let moved: Option<String> = self.with_retry("claim", |conn| {
            redis::cmd("BLMOVE")
                .arg(&pending)
                .arg(&claiming)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout)
                .query(conn)
        })?;
        let Some(raw) = moved else {
            return Ok(None);
        };

        let ticket: Ticket = raw
            .parse()
            .map_err(|e| JobSystemError::Storage(format!("queued ticket {raw:?}: {e}")))?;

        match self.start(ticket, &claiming) {
            Ok(Some(job)) => Ok(Some(job)),
            Ok(None) => {
                warn!(%ticket, "queued ticket is not pending, dropping");
                Ok(None)
            }
            Err(JobSystemError::NotFound(_)) => {
                warn!(%ticket, "queued ticket has no record, dropping");
                Ok(None)
            }
            Err(e) => {
                if let Err(requeue) = self.requeue_stranded() {
                    warn!(%ticket, error = %requeue, "ticket left in the claiming list");
                }
                Err(e)
            }
        }
    }

    fn claim_ticket(&self, ticket: Ticket) -> Result<Option<ClaimedJob>, JobSystemError> {
        self.start(ticket, &self.pending_key())
    }

    #[instrument(skip(self, update), fields(state = %update.state()), err)]
    fn update_status(&self, ticket: Ticket, update: StatusUpdate) -> Result<(), JobSystemError> {
        let to = update.state();
        let complete_without_location =
            to == JobState::Complete && update.result_location().is_none();

        let from = match to.predecessor() {
            Some(from) if !complete_without_location => from,
            _ => {
                let current = self.status(ticket)?;
                return Err(JobSystemError::InvalidTransition {
                    ticket,
                    from: current,
                    to,
                });
            }
        };

        self.transition(ticket, from, &update)?;
        info!(%ticket, state = %to, "job status updated");
        Ok(())
    }

    fn record(&self, ticket: Ticket) -> Result<JobRecord, JobSystemError> {
        let key = self.job_key(ticket);
        let fields: HashMap<String, String> =
            self.with_retry("record", |conn| redis::cmd("HGETALL").arg(&key).query(conn))?;
        if fields.is_empty() {
            return Err(JobSystemError::NotFound(ticket));
        }
        decode_record(ticket, &fields)
    }

    fn status(&self, ticket: Ticket) -> Result<JobState, JobSystemError> {
        let key = self.job_key(ticket);
        let state: Option<String> = self.with_retry("status", |conn| {
            redis::cmd("HGET").arg(&key).arg("state").query(conn)
        })?;
        match state {
            Some(state) => parse_state(&state),
            None => Err(JobSystemError::NotFound(ticket)),
        }
    }
}

fn is_transient(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
}

fn parse_state(raw: &str) -> Result<JobState, JobSystemError> {
    raw.parse().map_err(JobSystemError::Storage)
}

fn decode_record(
    ticket: Ticket,
    fields: &HashMap<String, String>,
) -> Result<JobRecord, JobSystemError> {
    let field = |name: &str| {
        fields
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| JobSystemError::Storage(format!("job {ticket}: missing field {name}")))
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, JobSystemError> {
        DateTime::parse_from_rfc3339(field(name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| JobSystemError::Storage(format!("job {ticket}: {name}: {e}")))
    };
    let optional = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

    let request: JobRequest = serde_json::from_str(field("request")?)
        .map_err(|e| JobSystemError::Storage(format!("job {ticket}: request: {e}")))?;

    Ok(JobRecord {
        ticket,
        state: parse_state(field("state")?)?,
        request,
        work_dir: PathBuf::from(field("work_dir")?),
        result_location: optional("result").map(PathBuf::from),
        message: optional("message"),
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}
