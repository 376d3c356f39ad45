use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Runtime;

use clinflow_infra::{
    InMemoryJobStore, JobStore, OrchestratorConfig, PostgresJobStore, StateMachine, WorkerPool,
};
use clinflow_providers::{InMemoryKnowledgeBase, InferenceProvider, build_provider};

/// Pipeline worker for clinical case jobs.
#[derive(Debug, Parser)]
#[command(name = "clinflow-worker", version)]
struct Args {
    /// Worker threads; overrides CLINFLOW_WORKERS.
    #[arg(long)]
    workers: Option<usize>,

    /// Drain runnable jobs and exit.
    #[arg(long)]
    once: bool,

    /// Report provider reachability and exit.
    #[arg(long)]
    ping: bool,
}

fn main() -> anyhow::Result<()> {
    clinflow_observability::init();
    let args = Args::parse();

    let mut config = OrchestratorConfig::from_env().context("loading configuration")?;
    if let Some(workers) = args.workers {
        config.workers = workers;
        config.validate()?;
    }

    let provider = build_provider(&config.inference).context("building inference provider")?;
    if args.ping {
        let status = provider.ping();
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let runtime = Runtime::new().context("starting tokio runtime")?;

    match config.database_url.clone() {
        Some(url) => {
            let pool = runtime
                .block_on(PgPoolOptions::new().max_connections(config.workers as u32 + 2).connect(&url))
                .context("connecting to postgres")?;
            let store = PostgresJobStore::new(pool, runtime.handle().clone());
            runtime.block_on(store.migrate())?;
            tracing::info!("using postgres job store");
            run(&runtime, &config, &args, store, provider)
        }
        None => {
            tracing::warn!("CLINFLOW_DATABASE_URL not set; jobs are kept in memory");
            run(&runtime, &config, &args, InMemoryJobStore::arc(), provider)
        }
    }
}

fn run<S>(
    runtime: &Runtime,
    config: &OrchestratorConfig,
    args: &Args,
    store: S,
    provider: Arc<dyn InferenceProvider>,
) -> anyhow::Result<()>
where
    S: JobStore + 'static,
{
    let stages = config.stage_set(knowledge_base(config)?, provider);
    let machine = StateMachine::new(store, stages, config.retry_controller()).with_lease_ttl(config.lease_ttl);
    let pool = WorkerPool::new(machine);

    if args.once {
        let stats = pool.drain("clinflow-worker-once")?;
        tracing::info!(
            stages = stats.stages_executed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            dead_lettered = stats.jobs_dead_lettered,
            "drained runnable jobs"
        );
        return Ok(());
    }

    let handle = pool.spawn(config.worker_pool())?;
    tracing::info!(workers = config.workers, "worker pool started");

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for shutdown signal")?;

    tracing::info!("shutting down");
    let stats = handle.stats();
    handle.shutdown();
    tracing::info!(
        stages = stats.stages_executed,
        succeeded = stats.jobs_succeeded,
        retries = stats.retries_scheduled,
        uptime_secs = stats.uptime_secs,
        "worker pool stopped"
    );
    Ok(())
}

fn knowledge_base(config: &OrchestratorConfig) -> anyhow::Result<Arc<InMemoryKnowledgeBase>> {
    let Some(path) = &config.knowledge_path else {
        tracing::warn!("CLINFLOW_KNOWLEDGE_PATH not set; retrieval has no documents");
        return Ok(Arc::new(InMemoryKnowledgeBase::new()));
    };
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let kb = InMemoryKnowledgeBase::from_json_reader(BufReader::new(file))
        .with_context(|| format!("loading knowledge documents from {}", path.display()))?;
    tracing::info!(documents = kb.len(), path = %path.display(), "knowledge base loaded");
    Ok(Arc::new(kb))
}
