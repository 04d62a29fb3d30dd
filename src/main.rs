//! Release auditor CLI entry point.
//!
//! `run` starts the audit loop; `check-config` validates the configuration
//! and prints the resolved settings.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use release_auditor::config::AuditorConfig;
use release_auditor::exec::{CommandRunner, ProcessRunner};
use release_auditor::jobs::docker::DockerJobs;
use release_auditor::jobs::JobControlPlane;
use release_auditor::queue::{run_workers, DelayingQueue, WorkQueue};
use release_auditor::reconcile::{Reconciler, ReconcilerDeps};
use release_auditor::release::{InMemoryReleases, ReleaseDirectory, ReleaseSource};
use release_auditor::signing::{CommandSigner, FsSignatureStore, SignatureStore, Signer};
use release_auditor::throttle::JobAdmissionThrottle;
use release_auditor::tracker::AuditTracker;
use release_auditor::verify::{JobVerifier, LocalVerifier};
use release_auditor::{clock, logging};

/// Release auditor: verify published releases and sign them once.
#[derive(Parser)]
#[command(name = "release-auditor", version, about)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the audit loop until interrupted.
    Run,
    /// Validate the configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => handle_run(cli.config).await,
        Command::CheckConfig => handle_check_config(cli.config),
    }
}

/// Validate config and print the resolved settings.
fn handle_check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    logging::init_cli();
    let config = AuditorConfig::load(path.as_deref())?;
    let paths = config.runtime_paths()?;

    println!("config ok");
    println!(
        "cli image:        {}",
        config.audit.cli_image.as_deref().unwrap_or("<from release>")
    );
    println!("job namespace:    {}", config.audit.job_namespace);
    println!("max jobs:         {}", config.audit.max_unfinished_jobs);
    println!("workers:          {}", config.workers.count);
    println!(
        "signer:           {}",
        config
            .signer
            .as_ref()
            .map_or("<audit only>", |s| s.command.as_str())
    );
    println!("signatures dir:   {}", paths.signatures_dir.display());
    println!("releases dir:     {}", paths.releases_dir.display());
    Ok(())
}

/// Run the audit loop.
async fn handle_run(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = AuditorConfig::load(path.as_deref()).context("failed to load configuration")?;

    let _logging_guard = match &config.logging.logs_dir {
        Some(dir) => Some(logging::init_production(dir)?),
        None => {
            logging::init_cli();
            None
        }
    };

    let paths = config.runtime_paths()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        releases = %paths.releases_dir.display(),
        signatures = %paths.signatures_dir.display(),
        "release auditor starting"
    );

    let queue = DelayingQueue::new();
    let work_queue: Arc<dyn WorkQueue> = Arc::new(queue.clone());
    let tracker = Arc::new(AuditTracker::with_clock(
        Arc::clone(&work_queue),
        Arc::new(clock::SystemClock),
        config.audit.failure_cooldown(),
    ));

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let signer: Option<Arc<dyn Signer>> = match &config.signer {
        Some(signer) => Some(Arc::new(CommandSigner::new(
            Arc::clone(&runner),
            &signer.command,
            signer.args.clone(),
            Duration::from_secs(signer.timeout_secs),
        ))),
        None => {
            info!("no signer configured, running audit only");
            None
        }
    };

    let docker = DockerJobs::connect(&config.audit.job_namespace, config.docker.log_tail_lines)
        .context("failed to configure Docker client")?;
    if !docker.available().await {
        warn!("Docker daemon unreachable, job verification will requeue until it answers");
    }
    let jobs: Arc<dyn JobControlPlane> = Arc::new(docker);
    let throttle = JobAdmissionThrottle::new(Arc::clone(&jobs), config.audit.max_unfinished_jobs);

    let releases = Arc::new(InMemoryReleases::new());
    let store: Arc<dyn SignatureStore> = Arc::new(FsSignatureStore::new(paths.signatures_dir.clone()));

    let reconciler = Arc::new(Reconciler::new(ReconcilerDeps {
        tracker: Arc::clone(&tracker),
        queue: work_queue,
        releases: Arc::clone(&releases) as Arc<dyn ReleaseSource>,
        store,
        signer,
        local: LocalVerifier::new(
            Arc::clone(&runner),
            &config.audit.local_tool,
            config.audit.local_timeout(),
        ),
        jobs: JobVerifier::new(jobs, throttle, config.audit.requeue_delay()),
        pinned_image: config.audit.cli_image.clone(),
        store_timeout: config.audit.store_timeout(),
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = run_workers(
        queue,
        config.workers.count,
        Arc::clone(&reconciler),
        shutdown_rx,
    );
    info!(workers = config.workers.count, "workers started");

    let directory = ReleaseDirectory::new(paths.releases_dir.clone());
    let mut ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(
        config.releases.poll_interval_secs,
    )));

    loop {
        tokio::select! {
            tick = ticks.next() => {
                if tick.is_none() {
                    break;
                }
                poll_releases(&directory, &releases, &reconciler).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task panicked");
        }
    }

    info!(tracked = tracker.len(), "release auditor shut down cleanly");
    Ok(())
}

/// Refresh the release registry from disk and sync every release.
async fn poll_releases(
    directory: &ReleaseDirectory,
    releases: &InMemoryReleases,
    reconciler: &Reconciler,
) {
    let loaded = match directory.load_all().await {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!(error = %e, dir = %directory.dir().display(), "unable to read releases");
            return;
        }
    };

    let mut seen = HashSet::new();
    for release in loaded {
        seen.insert((release.source.namespace.clone(), release.source.name.clone()));
        if !releases.upsert(release.clone()) {
            warn!(release = %release.config.name, "release registry unavailable");
            continue;
        }
        if let Err(e) = reconciler.sync_release_description(&release) {
            error!(error = %e, "audit sync failed");
        }
    }

    for (namespace, name) in releases.sources() {
        if !seen.contains(&(namespace.clone(), name.clone())) {
            debug!(%namespace, %name, "release description removed");
            releases.remove(&namespace, &name);
        }
    }
}
