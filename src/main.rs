use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowdex::config::Settings;
use flowdex::db::PgStore;
use flowdex::derivations::{DerivationKind, EvmKind, TokenTransfersKind};
use flowdex::error::IndexError;
use flowdex::fetcher::Fetcher;
use flowdex::ingester::{BackwardIngester, ForwardIngester};
use flowdex::node_pool::NodePool;
use flowdex::reaper::LeaseReaper;
use flowdex::reconciler::Reconciler;
use flowdex::rpc::{HttpAccessClient, RpcClient};
use flowdex::scheduler::DerivationScheduler;
use flowdex::sink::QueueSink;
use flowdex::sporks::SporkRouter;
use flowdex::store::Store;
use flowdex::{metrics, telemetry};

/// How many derivation workers each kind runs in this process.
const DERIVATION_WORKERS: usize = 2;

#[derive(Parser, Debug)]
#[command(name = "flowdex", about = "Flow chain indexer")]
struct Args {
    /// Optional config file; the environment always applies on top.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_tracing(telemetry::TelemetryConfig::default())?;
    metrics::register_all();

    let settings = Settings::load(Some(&args.config))?;
    info!(
        forward = settings.enable_forward_ingester,
        history = settings.enable_history_ingester,
        "flowdex starting"
    );

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&settings).await?);

    // Every endpoint any routing entry can name goes into one shared pool.
    let spork_table = settings.spork_table();
    let all_endpoints: BTreeSet<String> = spork_table
        .iter()
        .flat_map(|s| s.endpoints.iter().cloned())
        .chain(settings.live_endpoints())
        .chain(settings.historic_endpoints())
        .collect();
    let pool = Arc::new(NodePool::new(
        all_endpoints,
        settings.flow_rpc_rps_per_node,
        settings.flow_rpc_burst_per_node,
        settings.flow_rpc_rps,
        settings.flow_rpc_burst,
    ));

    let router = Arc::new(SporkRouter::new(
        spork_table,
        settings.crescendo_height,
        Duration::from_secs(settings.flow_rpc_timeout_secs),
    )?);

    let api = Arc::new(HttpAccessClient::new(Duration::from_secs(
        settings.flow_rpc_timeout_secs,
    ))?);
    let client = Arc::new(RpcClient::new(
        api,
        Arc::clone(&pool),
        Arc::clone(&router),
        settings.live_endpoints(),
    ));
    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&client),
        settings.tx_script_inline_max_bytes,
    ));

    let sink = Arc::new(QueueSink::new(1024));
    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&'static str, tokio::task::JoinHandle<Result<(), IndexError>>)> =
        Vec::new();

    if settings.enable_forward_ingester {
        let ingester = ForwardIngester::new(
            &settings,
            Arc::clone(&client),
            Arc::clone(&fetcher),
            Arc::clone(&store),
            sink.clone() as Arc<dyn flowdex::sink::CommitSink>,
        );
        let cancel = cancel.clone();
        tasks.push((
            "forward_ingester",
            tokio::spawn(async move { ingester.run(cancel).await }),
        ));
    }

    if settings.enable_history_ingester {
        let ingester = BackwardIngester::new(
            &settings,
            Arc::clone(&fetcher),
            Arc::clone(&store),
            Arc::clone(&router),
        );
        let cancel = cancel.clone();
        tasks.push((
            "history_ingester",
            tokio::spawn(async move { ingester.run(cancel).await }),
        ));
    }

    let mut derivation_kinds: Vec<(Arc<dyn DerivationKind>, u64)> = Vec::new();
    if settings.enable_token_transfers_worker {
        derivation_kinds.push((
            Arc::new(TokenTransfersKind),
            settings.token_transfers_worker_range,
        ));
    }
    if settings.enable_evm_worker {
        derivation_kinds.push((Arc::new(EvmKind), settings.evm_worker_range));
    }
    for (kind, range_size) in derivation_kinds.iter() {
        let scheduler = DerivationScheduler::new(
            Arc::clone(&store),
            Arc::clone(kind),
            *range_size,
            DERIVATION_WORKERS,
        );
        let cancel = cancel.clone();
        let name = kind.name();
        tasks.push((
            name,
            tokio::spawn(async move { scheduler.run(cancel).await }),
        ));
    }
    if !derivation_kinds.is_empty() {
        let reaper = LeaseReaper::new(Arc::clone(&store));
        let cancel = cancel.clone();
        tasks.push((
            "lease_reaper",
            tokio::spawn(async move { reaper.run(cancel).await }),
        ));
    }

    if settings.enable_lookup_repair {
        let reconciler = Reconciler::new(&settings, Arc::clone(&store));
        let cancel = cancel.clone();
        tasks.push((
            "reconciler",
            tokio::spawn(async move { reconciler.run(cancel).await }),
        ));
    }

    if !settings.metrics_addr.is_empty() {
        let addr = settings.metrics_addr.clone();
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tasks.push((
            "metrics",
            tokio::spawn(async move { metrics::serve(&addr, store, cancel).await }),
        ));
    }

    shutdown_signal().await;
    info!("shutdown signal received, draining");
    cancel.cancel();

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) | Ok(Err(IndexError::Cancelled)) => info!(task = name, "stopped"),
            Ok(Err(err)) => error!(task = name, error = %err, "stopped with error"),
            Err(join_err) => warn!(task = name, error = %join_err, "task panicked"),
        }
    }

    info!("flowdex stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
