use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use finsight_core::config::FinsightConfig;
use finsight_core::types::QueueName;
use finsight_engine::{
    AnalysisHandler, ExecutionHandler, FsScriptStore, HttpSandbox, Orchestrator,
};
use finsight_index::HttpVectorIndex;
use finsight_llm::OpenAiProvider;
use finsight_progress::ProgressMonitor;
use finsight_queue::{QueueWorker, WorkerConfig};
use finsight_store::StoreGateway;

mod app;
mod http;

/// Cadence of the session-cache / lock-map sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Terminal jobs older than this are purged by the hourly pass.
const JOB_RETENTION_DAYS: u32 = 7;

#[derive(Parser)]
#[command(name = "finsight-gateway", about = "Conversational financial-analysis gateway")]
struct Args {
    /// Path to finsight.toml (default: FINSIGHT_CONFIG or ~/.finsight/finsight.toml).
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    let code = tokio::runtime::Runtime::new()
        .expect("tokio runtime")
        .block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finsight=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = match FinsightConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("config load failed: {e}");
            return 1;
        }
    };

    let orch = match build_orchestrator(config) {
        Ok(o) => o,
        Err(e) => {
            error!("init failed: {e}");
            return 1;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Analysis worker.
    tasks.push(tokio::spawn(
        QueueWorker::new(
            orch.store.clone(),
            QueueName::Analysis,
            Arc::new(AnalysisHandler::new(orch.clone())),
            WorkerConfig {
                worker_id: format!("analysis-{}", Uuid::new_v4()),
                poll_interval: Duration::from_secs(orch.config.queue.poll_interval_seconds),
                visibility_seconds: orch.config.queue.analysis_visibility_seconds,
                max_concurrent: orch.config.queue.max_concurrent_analyses,
                retry_delay_seconds: orch.config.queue.analysis_retry_delay_seconds,
                max_attempts: orch.config.queue.analysis_max_retries,
            },
        )
        .run(shutdown_rx.clone()),
    ));

    // Execution worker. Executions are single-attempt; requeue is manual.
    tasks.push(tokio::spawn(
        QueueWorker::new(
            orch.store.clone(),
            QueueName::Execution,
            Arc::new(ExecutionHandler::new(orch.clone())),
            WorkerConfig {
                worker_id: format!("execution-{}", Uuid::new_v4()),
                poll_interval: Duration::from_secs(orch.config.queue.poll_interval_seconds),
                visibility_seconds: orch.config.queue.execution_visibility_seconds,
                max_concurrent: orch.config.queue.max_concurrent_executions,
                retry_delay_seconds: 0,
                max_attempts: 1,
            },
        )
        .run(shutdown_rx.clone()),
    ));

    // Progress monitor bridging the durable log to stream subscribers.
    tasks.push(tokio::spawn(
        ProgressMonitor::new(
            orch.store.clone(),
            orch.bus.clone(),
            Duration::from_millis(orch.config.progress.poll_interval_ms),
        )
        .run(shutdown_rx.clone()),
    ));

    // Housekeeping: session-cache TTL, lock map, terminal-job retention.
    tasks.push(tokio::spawn(sweep_loop(orch.clone(), shutdown_rx.clone())));

    let state = Arc::new(app::AppState { orch: orch.clone() });
    let router = app::build_router(state);

    let addr: SocketAddr = match format!("{}:{}", orch.config.gateway.bind, orch.config.gateway.port)
        .parse()
    {
        Ok(a) => a,
        Err(e) => {
            error!("invalid bind address: {e}");
            return 1;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return 1;
        }
    };
    info!("finsight gateway listening on {addr}");

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    });

    let mut interrupted = false;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("server error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, draining");
            interrupted = true;
        }
    }

    // Stop claiming, let in-flight handlers finish, then exit.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");

    if interrupted {
        130
    } else {
        0
    }
}

fn build_orchestrator(config: FinsightConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let store = Arc::new(StoreGateway::open(&config.database.path)?);
    let llm = Arc::new(OpenAiProvider::new(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
        Duration::from_secs(config.llm.request_timeout_seconds),
    ));
    let index = Arc::new(HttpVectorIndex::new(
        config.index.base_url.clone(),
        config.index.collection.clone(),
    ));
    let sandbox = Arc::new(HttpSandbox::new(
        config.sandbox.base_url.clone(),
        Duration::from_secs(config.sandbox.connect_timeout_seconds),
    ));
    let scripts = Arc::new(FsScriptStore::new(config.scripts.dir.clone())?);

    Ok(Arc::new(Orchestrator::new(
        config, store, llm, index, sandbox, scripts,
    )))
}

async fn sweep_loop(orch: Arc<Orchestrator>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                orch.sessions.sweep_idle();
                orch.sweep_session_locks();
                ticks += 1;
                // Retention pass once an hour.
                if ticks % 60 == 0 {
                    match orch.store.purge_terminal_jobs(JOB_RETENTION_DAYS) {
                        Ok(0) => {}
                        Ok(n) => info!(purged = n, "terminal jobs purged"),
                        Err(e) => warn!("job purge failed: {e}"),
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
