//! External search engine boundary.
//!
//! The alignment computation itself is not part of this crate. A
//! [`SearchEngine`] receives a claimed job and produces an artifact path;
//! [`CommandEngine`] does that by running a configured program.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::ClaimedJob;

/// Query file written into every work directory.
pub const QUERY_FILE: &str = "job.fasta";

/// Artifact looked up when the engine does not name one on stdout.
pub const DEFAULT_ARTIFACT: &str = "result.tar.gz";

const STDOUT_LOG: &str = "engine.stdout.log";
const STDERR_LOG: &str = "engine.stderr.log";
const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure to produce a result for a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("failed to prepare work directory: {0}")]
    Prepare(String),
    #[error("failed to start engine: {0}")]
    Spawn(String),
    #[error("engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("engine timed out after {0:?}")]
    TimedOut(Duration),
    #[error("engine produced no artifact (expected {0})")]
    MissingArtifact(PathBuf),
    #[error("interrupted by shutdown")]
    Cancelled,
}

/// Runs one search.
///
/// Implementations must return promptly once `cancel` fires.
pub trait SearchEngine: Send + Sync {
    fn run(&self, job: &ClaimedJob, cancel: &CancellationToken) -> Result<PathBuf, ExecutionError>;
}

impl<F> SearchEngine for F
where
    F: Fn(&ClaimedJob, &CancellationToken) -> Result<PathBuf, ExecutionError> + Send + Sync,
{
    fn run(&self, job: &ClaimedJob, cancel: &CancellationToken) -> Result<PathBuf, ExecutionError> {
        self(job, cancel)
    }
}

/// Engine that spawns an external program per job.
///
/// Invocation: `program [args_prefix..] <mode> <query.fasta> <work_dir> <db1,db2,..>`
/// with `MSAQ_TICKET`, `MSAQ_MODE` and `MSAQ_DATABASES` set. The artifact is
/// the file named by the last non-empty stdout line, or
/// `<work_dir>/result.tar.gz`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args_prefix: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args_prefix: Vec::new(),
            timeout: None,
        }
    }

    /// Arguments placed before the per-job arguments.
    pub fn with_args_prefix<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args_prefix = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `work_dir` and `query` must be absolute: the child runs inside `work_dir`.
    fn spawn(
        &self,
        job: &ClaimedJob,
        work_dir: &Path,
        query: &Path,
    ) -> Result<std::process::Child, ExecutionError> {
        let variant = job.request.variant();
        let databases = variant.databases().join(",");

        let stdout = File::create(work_dir.join(STDOUT_LOG))
            .map_err(|e| ExecutionError::Prepare(e.to_string()))?;
        let stderr = File::create(work_dir.join(STDERR_LOG))
            .map_err(|e| ExecutionError::Prepare(e.to_string()))?;

        Command::new(&self.program)
            .args(&self.args_prefix)
            .arg(variant.mode())
            .arg(query)
            .arg(work_dir)
            .arg(&databases)
            .env("MSAQ_TICKET", job.ticket.to_string())
            .env("MSAQ_MODE", variant.mode())
            .env("MSAQ_DATABASES", &databases)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("{}: {}", self.program.display(), e)))
    }
}

impl SearchEngine for CommandEngine {
    fn run(&self, job: &ClaimedJob, cancel: &CancellationToken) -> Result<PathBuf, ExecutionError> {
        let work_dir = &job.work_dir;
        fs::create_dir_all(work_dir).map_err(|e| ExecutionError::Prepare(e.to_string()))?;
        let absolute = fs::canonicalize(work_dir).map_err(|e| ExecutionError::Prepare(e.to_string()))?;

        let query = absolute.join(QUERY_FILE);
        fs::write(&query, fasta_contents(job)).map_err(|e| ExecutionError::Prepare(e.to_string()))?;

        let mut child = self.spawn(job, &absolute, &query)?;
        info!(ticket = %job.ticket, pid = child.id(), program = %self.program.display(), "engine started");

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(ExecutionError::Spawn(e.to_string())),
            }

            if cancel.is_cancelled() {
                kill(&mut child, job);
                return Err(ExecutionError::Cancelled);
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    kill(&mut child, job);
                    return Err(ExecutionError::TimedOut(timeout));
                }
            }

            thread::sleep(POLL_INTERVAL);
        };

        debug!(ticket = %job.ticket, ?status, elapsed_ms = started.elapsed().as_millis() as u64, "engine exited");

        if !status.success() {
            return Err(ExecutionError::Failed {
                status: describe(status),
                stderr: tail(&work_dir.join(STDERR_LOG), STDERR_TAIL_LINES),
            });
        }

        locate_artifact(work_dir)
    }
}

/// Query as FASTA, with a header named after the ticket when it has none.
fn fasta_contents(job: &ClaimedJob) -> String {
    let query = job.request.variant().query();
    if query.starts_with('>') {
        format!("{query}\n")
    } else {
        format!(">{}\n{}\n", job.ticket, query)
    }
}

fn kill(child: &mut std::process::Child, job: &ClaimedJob) {
    if let Err(e) = child.kill() {
        warn!(ticket = %job.ticket, error = %e, "failed to kill engine");
    }
    let _ = child.wait();
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}

fn tail(path: &Path, lines: usize) -> String {
    let Ok(file) = File::open(path) else {
        return String::new();
    };
    let all: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n").trim().to_string()
}

fn locate_artifact(work_dir: &Path) -> Result<PathBuf, ExecutionError> {
    let named = fs::read_to_string(work_dir.join(STDOUT_LOG))
        .ok()
        .and_then(|out| {
            out.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .next_back()
                .map(|l| work_dir.join(l))
        });

    if let Some(path) = named.filter(|p| p.is_file()) {
        return Ok(path);
    }

    let fallback = work_dir.join(DEFAULT_ARTIFACT);
    if fallback.is_file() {
        Ok(fallback)
    } else {
        Err(ExecutionError::MissingArtifact(fallback))
    }
}
