use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use msaq_api::cli::{self, CliError, CliOptions, CliOutcome};
use msaq_api::{server, shutdown};
use msaq_core::DatabaseCatalog;
use msaq_infra::jobs::{JobSystem, LocalJobSystem};
use msaq_infra::workers::{SearchWorker, WorkerHandle};
use msaq_infra::{AppConfig, CommandEngine, DirectoryCatalog, Dispatcher};

#[derive(Parser, Debug)]
#[command(name = "msaq")]
#[command(version)]
#[command(about = "Asynchronous MSA and pair search dispatch")]
#[command(propagate_version = true)]
struct Args {
    /// JSON config file (written with defaults if missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Redis URL, overrides config and MSAQ_REDIS_URL
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Root of per-ticket work directories
    #[arg(long, global = true)]
    results_dir: Option<PathBuf>,

    /// Directory of `*.params` database descriptors
    #[arg(long, global = true)]
    databases_dir: Option<PathBuf>,

    /// Run mode (default: server)
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// HTTP server submitting to the Redis job system
    Server {
        /// Listen address
        #[arg(long)]
        address: Option<String>,
    },

    /// Search workers claiming jobs from the Redis job system
    Worker {
        /// Worker threads in this process
        #[arg(long, default_value = "1")]
        workers: usize,
    },

    /// HTTP server plus in-process workers over the local job system
    Local {
        /// Listen address
        #[arg(long)]
        address: Option<String>,

        /// Worker threads (default: local.workers from config)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Submit one request, run it locally and wait for the result
    Cli {
        /// Request JSON `{q, dbs, mode, email}`, or `@file`
        #[arg(long)]
        request: String,

        /// Resubmit even if an equivalent job exists
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("msaq: {e:#}");
            return ExitCode::from(2);
        }
    };

    msaq_observability::init(config.verbose);
    info!(config = ?args.config, results = %config.paths.results.display(), "configuration loaded");

    match run(args.command.unwrap_or(Commands::Server { address: None }), config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let user_error = e
                .downcast_ref::<CliError>()
                .is_some_and(CliError::is_user_error);
            if user_error {
                eprintln!("msaq: {e}");
                ExitCode::from(2)
            } else {
                error!(error = %format!("{e:#}"), "fatal error");
                eprintln!("msaq: {e:#}");
                ExitCode::from(1)
            }
        }
    }
}

/// File (or defaults), then environment, then flags.
fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_or_create(path)?,
        None => AppConfig::default(),
    };
    config.apply_env();

    if let Some(url) = &args.redis_url {
        config.redis.url = url.clone();
    }
    if let Some(dir) = &args.results_dir {
        config.paths.results = dir.clone();
    }
    if let Some(dir) = &args.databases_dir {
        config.paths.databases = dir.clone();
    }
    config.verbose |= args.verbose;

    match &args.command {
        Some(Commands::Server { address: Some(address) })
        | Some(Commands::Local { address: Some(address), .. }) => {
            config.server.address = address.clone();
        }
        _ => {}
    }
    if let Some(Commands::Local { workers: Some(workers), .. }) = &args.command {
        config.local.workers = *workers;
    }

    config.validate()?;
    config.ensure_paths()?;
    Ok(config)
}

async fn run(command: Commands, config: AppConfig) -> anyhow::Result<u8> {
    let cancel = shutdown::install_shutdown_handler().context("failed to install signal handlers")?;
    let engine = Arc::new(config.command_engine());

    match command {
        Commands::Server { .. } => {
            let jobs = redis_jobs(&config)?;
            let dispatcher = Arc::new(Dispatcher::new(jobs, load_catalog(&config)?, &config.paths.results));
            server::serve(dispatcher, &config.server.address, cancel).await?;
        }
        Commands::Worker { workers } => {
            let jobs = redis_jobs(&config)?;
            let handles = spawn_workers(workers.max(1), &cancel, |i| {
                SearchWorker::new(Arc::clone(&jobs), Arc::clone(&engine), config.redis_worker(worker_name(i)))
            })?;
            cancel.cancelled().await;
            join_workers(handles).await;
        }
        Commands::Local { .. } => {
            let jobs: Arc<dyn JobSystem> = Arc::new(LocalJobSystem::open(&config.paths.results)?);
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::clone(&jobs),
                load_catalog(&config)?,
                &config.paths.results,
            ));
            let handles = spawn_workers(config.local.workers, &cancel, |i| {
                SearchWorker::new(Arc::clone(&jobs), Arc::clone(&engine), config.local_worker(worker_name(i)))
            })?;

            let served = server::serve(dispatcher, &config.server.address, cancel.clone()).await;
            cancel.cancel();
            join_workers(handles).await;
            served?;
        }
        Commands::Cli { request, force } => {
            let payload = cli::parse_request(&request)?;
            let jobs = Arc::new(LocalJobSystem::open(&config.paths.results)?);
            let dispatcher = Dispatcher::new(jobs, load_catalog(&config)?, &config.paths.results);
            let options = CliOptions {
                force,
                poll: Duration::from_millis(config.worker.poll_ms.clamp(10, 1000)),
                worker: config.local_worker("msaq-cli-worker"),
            };

            let outcome = tokio::task::spawn_blocking(move || {
                cli::run(&dispatcher, engine, &payload, options, &cancel)
            })
            .await??;

            match &outcome {
                CliOutcome::Complete(location) => println!("{}", location.display()),
                CliOutcome::Failed(message) => eprintln!("msaq: search failed: {message}"),
                CliOutcome::Interrupted => eprintln!("msaq: interrupted"),
            }
            return Ok(outcome.exit_code());
        }
    }

    Ok(0)
}

fn worker_name(index: usize) -> String {
    format!("msaq-worker-{index}")
}

fn load_catalog(config: &AppConfig) -> anyhow::Result<Arc<dyn DatabaseCatalog>> {
    let dir = &config.paths.databases;
    if !dir.exists() {
        warn!(dir = %dir.display(), "databases directory missing, catalog is empty");
        return Ok(Arc::new(DirectoryCatalog::default()));
    }
    let catalog = DirectoryCatalog::load(dir)?;
    info!(databases = ?catalog.ids(), "database catalog ready");
    Ok(Arc::new(catalog))
}

fn spawn_workers<S>(
    count: usize,
    cancel: &CancellationToken,
    build: impl Fn(usize) -> SearchWorker<S, CommandEngine>,
) -> anyhow::Result<Vec<WorkerHandle>>
where
    S: JobSystem + 'static,
{
    (0..count)
        .map(|i| {
            build(i)
                .spawn(cancel.child_token())
                .context("failed to spawn search worker")
        })
        .collect()
}

async fn join_workers(handles: Vec<WorkerHandle>) {
    let joined = tokio::task::spawn_blocking(move || {
        for handle in handles {
            let stats = handle.stats();
            handle.join();
            info!(?stats, "worker joined");
        }
    })
    .await;
    if let Err(e) = joined {
        error!(error = %e, "failed to join workers");
    }
}

#[cfg(feature = "redis")]
fn redis_jobs(config: &AppConfig) -> anyhow::Result<Arc<dyn JobSystem>> {
    use msaq_infra::jobs::RedisJobSystem;

    let jobs = RedisJobSystem::new(&config.redis.url, Some(config.redis.prefix.clone()))?
        .with_retry_policy(config.retry_policy());
    match jobs.ping().and_then(|()| jobs.requeue_stranded()) {
        Ok(moved) => info!(moved, "redis job system ready"),
        Err(e) => warn!(error = %e, "redis not reachable yet, requests will retry"),
    }
    Ok(Arc::new(jobs))
}

#[cfg(not(feature = "redis"))]
fn redis_jobs(_config: &AppConfig) -> anyhow::Result<Arc<dyn JobSystem>> {
    anyhow::bail!("this build has no redis support; use the `local` or `cli` run mode")
}
