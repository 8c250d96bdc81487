use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use tokio::sync::mpsc;

use settlement::admission::{OperatorKey, RateLimits, ReadinessGate};
use settlement::api::{self, AppState};
use settlement::attestation::fdc::FdcOracle;
use settlement::attestation::ProofService;
use settlement::bridge::{BridgeService, BridgeSettings};
use settlement::cancellation::CancellationService;
use settlement::config::{Config, StoreBackend};
use settlement::db::{self, MemoryStore, PgStore, Store};
use settlement::evm::client::EvmClient;
use settlement::recovery::{RecoveryService, RecoverySettings};
use settlement::redemption::{RedemptionService, RedemptionSettings};
use settlement::retry::RetryConfig;
use settlement::worker::{job_queue, Sweeper, Worker};
use settlement::xrpl::rpc::XrplRpcClient;

/// Jobs buffered between the API and the worker
const JOB_QUEUE_CAPACITY: usize = 1024;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting FXRP settlement service");

    let config = Config::load()?;
    tracing::info!(
        chain_id = config.evm.chain_id,
        xrpl_network = %config.xrpl.network,
        vaults = config.vaults.len(),
        store = ?config.store,
        "Configuration loaded"
    );

    // The API answers probes right away; everything else waits on the gate
    let gate = Arc::new(ReadinessGate::new());

    let store: Arc<dyn Store> = match config.store {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&config.database.url).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, records do not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let retry = RetryConfig::default();
    let ledger = Arc::new(XrplRpcClient::new(config.xrpl.all_rpc_urls(), retry.clone())?);
    let evm = Arc::new(EvmClient::new(&config.evm, retry.clone())?);
    let block = evm
        .block_number()
        .await
        .map_err(|e| eyre::eyre!("EVM RPC unreachable: {}", e))?;
    tracing::info!(block, operator = %evm.operator_address(), "EVM client connected");

    let oracle = Arc::new(FdcOracle::new(&config.attestation, evm.clone(), retry.clone())?);
    let proofs = Arc::new(ProofService::new(
        oracle,
        Duration::from_millis(config.attestation.poll_interval_ms),
        config.attestation.max_polls,
    ));
    let vaults = Arc::new(config.vault_registry()?);

    let bridges = Arc::new(BridgeService::new(
        store.clone(),
        ledger.clone(),
        evm.clone(),
        evm.clone(),
        proofs.clone(),
        vaults.clone(),
        BridgeSettings::from_config(&config),
    ));
    let redemptions = Arc::new(RedemptionService::new(
        store.clone(),
        ledger,
        evm.clone(),
        evm,
        proofs,
        vaults,
        RedemptionSettings::from_config(&config),
    ));
    let recovery = Arc::new(RecoveryService::new(
        store.clone(),
        bridges.clone(),
        redemptions.clone(),
        RecoverySettings::from_config(&config),
    ));
    let cancellation = Arc::new(CancellationService::new(
        store.clone(),
        chrono::Duration::seconds(config.bridge.cancel_window_secs as i64),
    ));

    let (queue, jobs) = job_queue(JOB_QUEUE_CAPACITY);
    let worker = Worker::new(
        bridges.clone(),
        redemptions.clone(),
        queue.clone(),
        config.bridge.worker_concurrency,
    );
    let sweeper = Sweeper::new(
        store.clone(),
        bridges.clone(),
        queue.clone(),
        Duration::from_millis(config.bridge.sweep_interval_ms),
    );

    let state = Arc::new(AppState {
        store,
        bridges,
        redemptions,
        recovery,
        cancellation,
        queue,
        gate: gate.clone(),
    });
    let router = api::router(
        state,
        OperatorKey::new(config.api.admin_api_key.as_str()),
        RateLimits::from_config(&config.api),
    )
    .wrap_err("Failed to build API router")?;

    // Create shutdown channels
    let (worker_shutdown_tx, worker_shutdown_rx) = mpsc::channel::<()>(1);
    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = mpsc::channel::<()>(1);
    let (api_shutdown_tx, mut api_shutdown_rx) = mpsc::channel::<()>(1);

    let signal_gate = gate.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_gate.mark_unready();
        let _ = worker_shutdown_tx.send(()).await;
        let _ = sweeper_shutdown_tx.send(()).await;
        let _ = api_shutdown_tx.send(()).await;
    });

    let worker_handle = tokio::spawn(worker.run(jobs, worker_shutdown_rx));
    let sweeper_handle = tokio::spawn(sweeper.run(sweeper_shutdown_rx));

    gate.mark_ready();
    tracing::info!("Collaborators initialized, accepting traffic");

    api::serve(router, &config.api.bind_address, config.api.port, async move {
        let _ = api_shutdown_rx.recv().await;
    })
    .await?;

    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "Worker task panicked");
    }
    if let Err(e) = sweeper_handle.await {
        tracing::error!(error = %e, "Sweeper task panicked");
    }

    tracing::info!("FXRP settlement service stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fxrp_settlement=debug,settlement=debug"));

    let json = std::env::var("LOG_FORMAT").map_or(false, |v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
