use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ingest_core::IngestionTask;
use ingest_queue::{Disposition, InMemoryTaskQueue};
use ingest_service::{
    ChunkingIngestor, FakeRunClient, InMemoryChunkSink, IngestFixture, IngestOutcome, RunDetail, Service,
    TracingMetrics,
};
use ingest_storage::{ControlStore, Outbox};

#[derive(Parser)]
#[command(name = "ingestctl", version)]
struct Cli {
    /// Service root holding .ingest/ (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the service root (creates .ingest/, config, db)
    Init,

    /// Deliver a build-completion notification read from a JSON file
    BuildEvent {
        #[arg(long)]
        message: PathBuf,
    },

    /// Deliver a run-completion notification; `--run` is the run detail the
    /// run service would return
    RunEvent {
        #[arg(long)]
        message: PathBuf,
        #[arg(long)]
        run: PathBuf,
    },

    /// List outbox tasks; with --relay, move pending ones to the queue and
    /// print them as JSON lines
    Tasks {
        #[arg(long, default_value_t = false)]
        relay: bool,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Presubmit join statistics for the last 24 hours
    Stats,

    /// Run one ingestion task against canned build/results data
    Ingest {
        #[arg(long)]
        task: PathBuf,
        #[arg(long)]
        fixture: PathBuf,
    },
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn report(what: &str, res: ingest_core::Result<ingest_core::HandlerOutcome>) -> anyhow::Result<()> {
    let disposition = Disposition::for_result(&res);
    println!("{what}: {} ({})", disposition.as_str(), disposition.status_code());
    res.map(|_| ()).map_err(anyhow::Error::from)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(r) => r,
        None => std::env::current_dir()?,
    };
    let now = Utc::now();
    tracing::debug!(root = %root.display(), "service root");

    match cli.cmd {
        Command::Init => {
            Service::init_root(&root)?;
            println!("Initialized ingestion service in {}", root.display());
        }
        Command::BuildEvent { message } => {
            let svc = Service::open(root, Arc::new(TracingMetrics))?;
            let handler = svc.notification_handler(Arc::new(FakeRunClient::new()))?;
            report("build", handler.handle_build(&read(&message)?, now))?;
        }
        Command::RunEvent { message, run } => {
            let svc = Service::open(root, Arc::new(TracingMetrics))?;
            let detail: RunDetail = serde_json::from_slice(&read(&run)?).context("parse run detail")?;
            let runs = FakeRunClient::new();
            runs.insert(detail);
            let handler = svc.notification_handler(Arc::new(runs))?;
            report("run", handler.handle_run(&read(&message)?, now))?;
        }
        Command::Tasks { relay, limit } => {
            let svc = Service::open(root, Arc::new(TracingMetrics))?;
            if relay {
                let queue = InMemoryTaskQueue::new();
                let r = svc.relay(&queue, limit, now)?;
                for task in queue.drain()? {
                    println!("{}", serde_json::to_string(&task.payload)?);
                }
                eprintln!("relayed {} task(s), {} deduplicated", r.enqueued, r.deduplicated);
            } else {
                let tasks = svc.storage.list_tasks()?;
                println!("Tasks: {}", tasks.len());
                for t in tasks {
                    let state = if t.dispatched_at.is_some() { "dispatched" } else { "pending" };
                    println!("- {} [{}] {}", t.payload.kind(), state, t.dedup_key);
                }
            }
        }
        Command::Stats => {
            let svc = Service::open(root, Arc::new(TracingMetrics))?;
            let stats = svc.storage.presubmit_join_stats(now)?;
            if stats.is_empty() {
                println!("No presubmit builds in the last 24 hours");
            }
            for (project, s) in stats {
                println!("{project}:");
                for hour in 0..s.total_builds_by_hour.len() {
                    let total = s.total_builds_by_hour[hour];
                    if total == 0 {
                        continue;
                    }
                    println!(
                        "  {hour:>2}h: total={total} awaiting_build={} awaiting_presubmit={}",
                        s.awaiting_build_by_hour[hour], s.awaiting_presubmit_result_by_hour[hour]
                    );
                }
            }
        }
        Command::Ingest { task, fixture } => {
            let svc = Service::open(root, Arc::new(TracingMetrics))?;
            let task: IngestionTask = serde_json::from_slice(&read(&task)?).context("parse ingestion task")?;
            let fixture: IngestFixture = serde_json::from_slice(&read(&fixture)?).context("parse fixture")?;
            let build = task.build.as_ref().context("ingestion task has no build")?;
            let (builds, results) = fixture.into_fakes(&build.host, build.id);
            let sink = Arc::new(InMemoryChunkSink::new());
            let clustering = Arc::new(ChunkingIngestor::new(sink.clone()));

            match svc.ingest(&task, Arc::new(builds), Arc::new(results), clustering, now)? {
                IngestOutcome::Ingested(r) => println!(
                    "ingested {} page(s), {} variant(s), {} row(s) written, {} chunk(s){}",
                    r.pages,
                    r.variants,
                    r.variants_written,
                    sink.chunks().len(),
                    if r.truncated { ", truncated" } else { "" }
                ),
                IngestOutcome::Skipped(reason) => println!("skipped: {}", reason.as_str()),
            }
        }
    }

    Ok(())
}
