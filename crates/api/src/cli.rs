//! Single-shot run mode: submit one request, process it in-process, report.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use msaq_core::SearchPayload;
use msaq_infra::jobs::{JobState, JobSystemError};
use msaq_infra::workers::{SearchWorker, WorkerConfig};
use msaq_infra::{DispatchError, Dispatcher, SearchEngine};

/// Exit code after an interrupt (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("failed to read request file {path}: {source}")]
    ReadRequest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl CliError {
    /// Bad input rather than a service fault.
    pub fn is_user_error(&self) -> bool {
        match self {
            CliError::ReadRequest { .. } => true,
            CliError::Dispatch(e) => e.is_user_error(),
        }
    }
}

/// How a single-shot run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliOutcome {
    Complete(PathBuf),
    Failed(String),
    Interrupted,
}

impl CliOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliOutcome::Complete(_) => 0,
            CliOutcome::Failed(_) => 1,
            CliOutcome::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliOptions {
    /// Skip fingerprint deduplication
    pub force: bool,
    /// Status poll interval while waiting
    pub poll: Duration,
    pub worker: WorkerConfig,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            force: false,
            poll: Duration::from_millis(200),
            worker: WorkerConfig::default().with_name("msaq-cli-worker"),
        }
    }
}

/// Parse a request given inline as JSON, or as `@path` to a JSON file.
pub fn parse_request(raw: &str) -> Result<SearchPayload, CliError> {
    let body = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).map_err(|source| CliError::ReadRequest {
            path: PathBuf::from(path),
            source,
        })?,
        None => raw.to_string(),
    };
    Ok(SearchPayload::from_json(&body).map_err(DispatchError::from)?)
}

/// Submit `payload`, run that one job on the calling thread, and report.
///
/// Only the submitted ticket is processed; anything else queued under the
/// same root is left for a regular worker. When `cancel` fires the job in
/// flight is interrupted (it is recorded as failed) and the run reports
/// [`CliOutcome::Interrupted`].
pub fn run<E>(
    dispatcher: &Dispatcher,
    engine: Arc<E>,
    payload: &SearchPayload,
    options: CliOptions,
    cancel: &CancellationToken,
) -> Result<CliOutcome, CliError>
where
    E: SearchEngine + ?Sized,
{
    let ticket = dispatcher.submit(payload, options.force)?;
    info!(%ticket, "request submitted");

    let worker = SearchWorker::new(Arc::clone(dispatcher.jobs()), engine, options.worker);
    if worker
        .run_ticket(ticket, cancel)
        .map_err(DispatchError::from)?
        .is_none()
    {
        debug!(%ticket, "job was not pending, waiting for it to settle");
    }

    let settled = dispatcher.wait_for_terminal(ticket, options.poll, cancel)?;
    let record = match settled {
        Some(record) if !cancel.is_cancelled() || record.state == JobState::Complete => record,
        _ => {
            warn!(%ticket, "interrupted before the job settled");
            return Ok(CliOutcome::Interrupted);
        }
    };

    match (record.state, record.result_location) {
        (JobState::Complete, Some(location)) => Ok(CliOutcome::Complete(location)),
        (JobState::Error, _) => Ok(CliOutcome::Failed(
            record.message.unwrap_or_else(|| "search failed".to_string()),
        )),
        (state, _) => Err(CliError::Dispatch(
            JobSystemError::NotReady { ticket, state }.into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use msaq_core::{RequestError, StaticCatalog};
    use msaq_infra::jobs::{ClaimedJob, LocalJobSystem};
    use msaq_infra::ExecutionError;

    use super::*;

    fn dispatcher(dir: &std::path::Path) -> Dispatcher {
        let jobs = Arc::new(LocalJobSystem::open(dir).unwrap());
        let catalog = Arc::new(StaticCatalog::new(["uniref"]));
        Dispatcher::new(jobs, catalog, dir)
    }

    fn options() -> CliOptions {
        CliOptions {
            poll: Duration::from_millis(5),
            worker: WorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
            ..CliOptions::default()
        }
    }

    fn payload(mode: &str) -> SearchPayload {
        SearchPayload::from_json(&format!(
            r#"{{"q":"ABCDEF","dbs":["uniref"],"mode":"{mode}","email":"a@b.com"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn completed_run_reports_location() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let engine = Arc::new(|job: &ClaimedJob, _: &CancellationToken| -> Result<PathBuf, ExecutionError> {
            let artifact = job.work_dir.join("result.tar.gz");
            fs::write(&artifact, b"msa").map_err(|e| ExecutionError::Prepare(e.to_string()))?;
            Ok(artifact)
        });

        let outcome = run(&dispatcher, engine, &payload("standard"), options(), &CancellationToken::new()).unwrap();
        let CliOutcome::Complete(location) = &outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(location.ends_with("result.tar.gz"));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn failed_run_reports_message() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let engine = Arc::new(|_: &ClaimedJob, _: &CancellationToken| -> Result<PathBuf, ExecutionError> {
            Err(ExecutionError::Failed {
                status: "exit status: 3".into(),
                stderr: "no hits".into(),
            })
        });

        let outcome = run(&dispatcher, engine, &payload("pairgreedy"), options(), &CancellationToken::new()).unwrap();
        let CliOutcome::Failed(message) = &outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(message.contains("no hits"));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn interrupt_cancels_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let engine = Arc::new(|_: &ClaimedJob, cancel: &CancellationToken| -> Result<PathBuf, ExecutionError> {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(ExecutionError::Cancelled)
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let outcome = run(&dispatcher, engine, &payload("standard"), options(), &cancel).unwrap();
        interrupter.join().unwrap();
        assert_eq!(outcome, CliOutcome::Interrupted);
        assert_eq!(outcome.exit_code(), INTERRUPTED_EXIT_CODE);

        let jobs = dispatcher.jobs();
        let records: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse::<msaq_core::Ticket>().ok())
            .map(|ticket| jobs.record(ticket).unwrap())
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, JobState::Error);
        assert_eq!(records[0].message.as_deref(), Some("interrupted by shutdown"));
    }

    #[test]
    fn only_the_submitted_job_is_run() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let stale = dispatcher
            .submit(&parse_request(r#"{"q":"MKVLA","dbs":["uniref"],"mode":"standard"}"#).unwrap(), false)
            .unwrap();

        let ran: Arc<std::sync::Mutex<Vec<msaq_core::Ticket>>> = Arc::default();
        let seen = Arc::clone(&ran);
        let engine = Arc::new(move |job: &ClaimedJob, _: &CancellationToken| -> Result<PathBuf, ExecutionError> {
            seen.lock().unwrap().push(job.ticket);
            let artifact = job.work_dir.join("result.tar.gz");
            fs::write(&artifact, b"msa").map_err(|e| ExecutionError::Prepare(e.to_string()))?;
            Ok(artifact)
        });

        let outcome = run(&dispatcher, engine, &payload("standard"), options(), &CancellationToken::new()).unwrap();
        assert!(matches!(outcome, CliOutcome::Complete(_)));

        let ran = ran.lock().unwrap();
        assert_eq!(ran.len(), 1);
        assert_ne!(ran[0], stale);
        assert_eq!(dispatcher.jobs().status(stale).unwrap(), JobState::Pending);
    }

    #[test]
    fn unknown_database_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        let engine = Arc::new(|_: &ClaimedJob, _: &CancellationToken| -> Result<PathBuf, ExecutionError> {
            unreachable!("nothing should be claimed")
        });
        let payload = parse_request(r#"{"q":"ABCDEF","dbs":["doesnotexist"],"mode":"standard"}"#).unwrap();

        let err = run(&dispatcher, engine, &payload, options(), &CancellationToken::new()).unwrap_err();
        assert!(err.is_user_error());
        assert!(matches!(
            err,
            CliError::Dispatch(DispatchError::Request(RequestError::UnknownDatabase(_)))
        ));
    }

    #[test]
    fn request_can_come_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        fs::write(&path, r#"{"query":"ABCDEF","mode":"pairgreedy"}"#).unwrap();

        let payload = parse_request(&format!("@{}", path.display())).unwrap();
        assert_eq!(payload.mode, "pairgreedy");

        let missing = parse_request("@/definitely/not/here.json").unwrap_err();
        assert!(matches!(missing, CliError::ReadRequest { .. }));
        assert!(parse_request("{nope").unwrap_err().is_user_error());
    }
}
