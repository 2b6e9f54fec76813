//! Bridge watcher node
//!
//! Polls a source-chain bridge contract for `TokensLocked` events, asks an
//! external oracle whether each lock is legitimate, and mints on the
//! destination chain (or logs the mint in simulate mode).
//!
//! Progress is checkpointed so a restart neither skips nor repeats events.

use std::sync::Arc;

use eyre::WrapErr;
use tracing::{error, info};

use bridge_watcher::chain_reader::EvmChainReader;
use bridge_watcher::checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PgCheckpointStore,
};
use bridge_watcher::config::{CheckpointBackend, Config, DispatchMode, LogFormat};
use bridge_watcher::dispatcher::{ActionDispatcher, EvmMintDispatcher, SimulatedDispatcher};
use bridge_watcher::server::start_server;
use bridge_watcher::validator::OracleValidator;
use bridge_watcher::watcher::BridgeWatcher;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Logging format comes from the environment before the full config loads
    let _ = dotenvy::dotenv();
    init_logging(log_format_from_env());

    info!("Starting bridge watcher");

    let config = Config::load()?;
    info!(
        watcher_id = %config.watcher_id,
        source_chain = %config.source.chain_name,
        source_rpc = %config.source.rpc_urls[0],
        rpc_fallbacks = config.source.rpc_urls.len() - 1,
        bridge = %config.source.bridge_address,
        dest_chain = %config.destination.chain_name,
        dispatch_mode = ?config.destination.mode,
        "Configuration loaded"
    );

    let store: Arc<dyn CheckpointStore> = match &config.checkpoint {
        CheckpointBackend::File { path } => Arc::new(FileCheckpointStore::new(path)),
        CheckpointBackend::Postgres { database_url } => Arc::new(
            PgCheckpointStore::connect(database_url, &config.watcher_id)
                .await
                .wrap_err("Failed to open checkpoint database")?,
        ),
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
    };
    let checkpoint = Checkpoint::open(
        store,
        config.watcher.dedup_window_blocks,
        config.source.start_block,
    )
    .await
    .wrap_err("Failed to load checkpoint")?;

    let reader = Arc::new(EvmChainReader::new(
        &config.source.rpc_urls,
        config.source.bridge_address,
    )?);

    let validator = Arc::new(OracleValidator::new(
        config.oracle.url.clone(),
        config.oracle.api_key.clone(),
        config.source.chain_name.clone(),
        config.oracle.timeout,
    )?);

    let dispatcher: Arc<dyn ActionDispatcher> = match &config.destination.mode {
        DispatchMode::Simulate => Arc::new(SimulatedDispatcher::new(
            config.destination.chain_name.clone(),
            "simulated-minter",
        )),
        DispatchMode::Evm {
            rpc_url,
            minter_address,
            private_key,
        } => Arc::new(EvmMintDispatcher::new(rpc_url, minter_address, private_key)?),
    };

    let mut watcher = BridgeWatcher::new(
        reader,
        validator,
        dispatcher,
        checkpoint,
        config.watcher_settings(),
        config.backoff_config(),
    );

    // Start health server
    let stats = watcher.stats();
    let metrics = watcher.metrics();
    let bind_address = config.server.bind_address.clone();
    let port = config.server.port;
    tokio::spawn(async move {
        if let Err(e) = start_server(&bind_address, port, stats, metrics).await {
            error!(error = %e, "Health server failed");
        }
    });

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Handle signals
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    watcher.run(shutdown_rx).await?;

    info!("Bridge watcher stopped");
    Ok(())
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("LOG_FORMAT") {
        Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_watcher=debug"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init(),
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
