//! helmsmand: the Helmsman daemon.
//!
//! Assembles the rollout engine against a simulated local orchestrator:
//! - Record store (redb)
//! - Static image repository from `[[images]]`
//! - Simulated orchestrator seeded from `[[workloads]]`
//! - JSON-lines notification sink next to the store
//!
//! # Usage
//!
//! ```text
//! helmsmand --config helmsman.toml rollout --env prod --workload api --tag v42
//! helmsmand show --env prod --workload api --id 3f9c2a7d1b4e8f60
//! ```
//!
//! Ctrl-C during `rollout`, `trigger` or `resume` stops supervision
//! gracefully; the record is left `Paused` and can be resumed later. The
//! store file is held by the supervising process, so pause and terminate
//! requests for its record go to it as signals:
//!
//! ```text
//! kill -USR1 <pid>   # pause
//! kill -USR2 <pid>   # terminate (runs only)
//! ```

mod control;
mod images;
mod sim;
mod sink;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helmsman_core::{humanize, HelmsmanConfig, RecordKey, WorkloadKind};
use helmsman_rollout::{Engine, RolloutResult, RunMode, StartRequest};
use helmsman_state::{RecordStore, RolloutPolicy, RolloutRecord, RolloutState, RolloutStrategy};

use crate::images::StaticImageRepository;
use crate::sim::SimulatedOrchestrator;
use crate::sink::FileSink;

const DEFAULT_DATA_DIR: &str = "helmsman-data";
const STORE_FILE: &str = "helmsman.redb";
const NOTIFY_FILE: &str = "notifications.jsonl";

#[derive(Parser)]
#[command(name = "helmsmand", about = "Helmsman rollout daemon")]
struct Cli {
    /// Path to helmsman.toml.
    #[arg(long, global = true, default_value = "helmsman.toml")]
    config: PathBuf,

    /// Directory for the record store (overrides `[store] path`).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a rollout and supervise it until it ends.
    Rollout {
        #[arg(long)]
        env: String,

        #[arg(long)]
        workload: String,

        /// service, job, or adhoc.
        #[arg(long, default_value = "service")]
        kind: WorkloadKind,

        #[arg(long, default_value = "main")]
        branch: String,

        #[arg(long)]
        tag: String,

        /// Who is asking.
        #[arg(long, default_value = "helmsmand")]
        by: String,

        /// Replicas surged per step.
        #[arg(long, default_value = "1")]
        step: u32,

        /// Pause once the first step is ready.
        #[arg(long)]
        autopause: bool,

        /// Drain the predecessor before surging.
        #[arg(long)]
        recreate: bool,

        /// Create the record without triggering it.
        #[arg(long)]
        create_only: bool,
    },
    /// Trigger a record created with `--create-only`.
    Trigger(RecordArgs),
    /// Resume a paused record and supervise it until it ends.
    Resume(RecordArgs),
    /// Request a pause; repeat to force it.
    Pause(RecordArgs),
    /// Roll a paused or completed record back to its predecessor.
    Rollback(RecordArgs),
    /// Request termination of a run; repeat to force it.
    Terminate(RecordArgs),
    /// Print one record with its log.
    Show(RecordArgs),
    /// List the records of a workload, newest first.
    List {
        #[arg(long)]
        env: String,

        #[arg(long)]
        workload: String,
    },
}

#[derive(Args)]
struct RecordArgs {
    #[arg(long)]
    env: String,

    #[arg(long)]
    workload: String,

    #[arg(long)]
    id: String,
}

impl RecordArgs {
    fn key(&self) -> RecordKey {
        RecordKey::new(self.env.clone(), self.workload.clone(), self.id.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli.config)?;
    let store_path = store_path(cli.data_dir.as_deref(), &config);
    let engine = build_engine(&config, &store_path).await?;

    let outcome = run(&engine, cli.command).await;

    engine.shutdown().await;
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,helmsmand=debug,helmsman=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<HelmsmanConfig> {
    if !path.exists() {
        warn!(path = ?path, "config file not found, using defaults");
        return Ok(HelmsmanConfig::default());
    }
    let config = HelmsmanConfig::from_file(path)?;
    info!(
        path = ?path,
        images = config.images.len(),
        workloads = config.workloads.len(),
        "config loaded"
    );
    Ok(config)
}

fn store_path(data_dir: Option<&Path>, config: &HelmsmanConfig) -> PathBuf {
    match (data_dir, &config.store.path) {
        (Some(dir), _) => dir.join(STORE_FILE),
        (None, Some(path)) => path.clone(),
        (None, None) => Path::new(DEFAULT_DATA_DIR).join(STORE_FILE),
    }
}

async fn build_engine(config: &HelmsmanConfig, store_path: &Path) -> anyhow::Result<Engine> {
    let settings = config.settings()?;
    let data_dir = store_path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;

    let store = open_store(store_path)?;

    let sink = FileSink::open(&data_dir.join(NOTIFY_FILE)).await?;
    let images = Arc::new(StaticImageRepository::from_config(&config.images));
    let orchestrator = Arc::new(SimulatedOrchestrator::from_config(&config.workloads));

    let engine = Engine::builder(store, images)
        .adapter(WorkloadKind::Service, orchestrator.clone())
        .adapter(WorkloadKind::Job, orchestrator.clone())
        .adapter(WorkloadKind::AdHoc, orchestrator)
        .sink(Arc::new(sink))
        .settings(settings.clone())
        .build()?;
    info!(
        poll = %humanize(settings.poll_interval),
        lock_ttl = %humanize(settings.lock_ttl),
        "engine ready"
    );
    Ok(engine)
}

fn open_store(path: &Path) -> anyhow::Result<RecordStore> {
    let store = RecordStore::open(path).with_context(|| {
        format!(
            "opening record store {}; if another helmsmand is supervising a rollout, \
             signal that process instead (SIGUSR1 pauses, SIGUSR2 terminates)",
            path.display()
        )
    })?;
    info!(path = ?path, "record store opened");
    Ok(store)
}

async fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Rollout {
            env,
            workload,
            kind,
            branch,
            tag,
            by,
            step,
            autopause,
            recreate,
            create_only,
        } => {
            let policy = RolloutPolicy {
                strategy: if recreate {
                    RolloutStrategy::Recreate
                } else {
                    RolloutStrategy::Rolling
                },
                step,
                autopause,
            };
            let record = engine
                .start(StartRequest {
                    env,
                    workload,
                    kind,
                    branch,
                    tag,
                    requested_by: by,
                    policy: Some(policy),
                    trigger: None,
                })
                .await?;
            println!("created {}", record.key());
            if create_only {
                print_record(&record);
                return Ok(());
            }
            let key = record.key();
            supervise(engine, &key, engine.trigger(&key, RunMode::Wait)).await
        }
        Command::Trigger(args) => {
            let key = args.key();
            supervise(engine, &key, engine.trigger(&key, RunMode::Wait)).await
        }
        Command::Resume(args) => {
            let key = args.key();
            supervise(engine, &key, engine.resume(&key, RunMode::Wait)).await
        }
        Command::Pause(args) => {
            let record = engine.pause(&args.key()).await?;
            print_record(&record);
            // This process holds the store, so no supervisor is running.
            if record.state == RolloutState::Pausing {
                println!("no supervisor is running; pause again to force");
            }
            Ok(())
        }
        Command::Rollback(args) => {
            let record = engine.rollback(&args.key()).await?;
            print_record(&record);
            Ok(())
        }
        Command::Terminate(args) => {
            let record = engine.terminate(&args.key()).await?;
            print_record(&record);
            if record.state == RolloutState::Terminating {
                println!("no supervisor is running; terminate again to force");
            }
            Ok(())
        }
        Command::Show(args) => {
            let record = engine.get(&args.key())?;
            print_record(&record);
            for entry in &record.log {
                println!(
                    "  {} {:<5} {}",
                    entry.time,
                    format!("{:?}", entry.severity).to_lowercase(),
                    entry.message
                );
            }
            Ok(())
        }
        Command::List { env, workload } => {
            let records = engine.list(&env, &workload)?;
            if records.is_empty() {
                println!("no records for {env}/{workload}");
            }
            for record in &records {
                println!(
                    "{:<18} {:<12} {:<8} {:<10} {}",
                    record.id,
                    record.state,
                    record.kind,
                    record.tag,
                    humanize(record.clock)
                );
            }
            Ok(())
        }
    }
}

/// Drive an episode to its end, pausing it gracefully on Ctrl-C and
/// applying signalled control requests to its record.
async fn supervise<F>(engine: &Engine, key: &RecordKey, episode: F) -> anyhow::Result<()>
where
    F: Future<Output = RolloutResult<RolloutRecord>>,
{
    info!(
        %key,
        pid = std::process::id(),
        "supervising; SIGUSR1 pauses, SIGUSR2 terminates, Ctrl-C stops"
    );
    let control = control::serve(engine, key, control::listen());
    tokio::pin!(episode);
    tokio::pin!(control);
    let mut control_open = true;

    let outcome = loop {
        tokio::select! {
            outcome = &mut episode => break outcome,
            () = &mut control, if control_open => control_open = false,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping supervision");
                engine.shutdown().await;
                break episode.await;
            }
        }
    };

    let record = outcome?;
    print_record(&record);
    match record.state {
        RolloutState::Completed
        | RolloutState::Paused
        | RolloutState::RolledBack
        | RolloutState::Terminated => Ok(()),
        other => anyhow::bail!("{} ended {other}", record.key()),
    }
}

fn print_record(record: &RolloutRecord) {
    println!("{}", record.key());
    println!("  kind:     {}", record.kind);
    println!("  state:    {}", record.state);
    println!("  image:    {}:{} ({})", record.workload, record.tag, record.branch);
    if let Some(digest) = &record.digest {
        println!("  digest:   {digest}");
    }
    println!("  by:       {}", record.requested_by);
    println!("  clock:    {}", humanize(record.clock));
    println!(
        "  replicas: {} desired, {} successor pods, {} predecessor pods",
        record.desired_replicas,
        record.to_pods.len(),
        record.from_pods.len()
    );
    if let Some(from) = &record.from_ref {
        println!("  from:     {from}");
    }
    if let Some(to) = &record.to_ref {
        println!("  to:       {to}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_store_points_at_the_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);
        let _supervisor = open_store(&path).unwrap();

        let err = open_store(&path).err().unwrap();
        let message = format!("{err:#}");
        assert!(message.contains(&path.display().to_string()));
        assert!(message.contains("SIGUSR1 pauses"));
    }
}
