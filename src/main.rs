use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use lis_core::config::{default_instrument_from_env_value, store_backend_from_env_value};
use lis_core::constants::DEFAULT_DATA_DIR;
use lis_core::{CoreConfig, IngestionService, Stores};
use lis_listener::ListenerConfig;

/// Main entry point for the LIS application
///
/// Starts the instrument listener and the REST ingestion server concurrently. Both share one
/// store and one ingestion service; Ctrl-C stops both.
///
/// # Environment Variables
/// - `LIS_LISTENER_ADDR`: instrument listener address (default: "0.0.0.0:5001")
/// - `LIS_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `LIS_IDLE_TIMEOUT_SECS`: idle timeout per instrument connection (default: 60)
/// - `LIS_FRAMING`: "per-read" (default) or "mllp"
/// - `LIS_ENCODING`: "utf-8" (default) or "latin1"
/// - `LIS_DATA_DIR`: data directory for the file store (default: "lis_data")
/// - `LIS_STORE`: "file" (default) or "memory"
/// - `LIS_DEFAULT_INSTRUMENT`: instrument id used when a message names none
///
/// # Returns
/// * `Ok(())` - If both servers start and stop cleanly
/// * `Err(anyhow::Error)` - If configuration, startup or either server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lis_run=info".parse()?)
                .add_directive("lis_listener=info".parse()?)
                .add_directive("lis_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let core_cfg = Arc::new(CoreConfig::new(
        std::env::var("LIS_DATA_DIR")
            .unwrap_or_else(|_| DEFAULT_DATA_DIR.into())
            .into(),
        store_backend_from_env_value(std::env::var("LIS_STORE").ok())?,
        default_instrument_from_env_value(std::env::var("LIS_DEFAULT_INSTRUMENT").ok()),
    )?);
    let listener_cfg = ListenerConfig::from_env()?;
    let rest_addr = std::env::var("LIS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    tracing::info!("++ Starting LIS REST on {}", rest_addr);
    tracing::info!(
        "++ Store backend {:?} at {}",
        core_cfg.store_backend(),
        core_cfg.data_dir().display()
    );

    let stores = Stores::open(&core_cfg)?;
    let service = IngestionService::new(core_cfg, stores.results);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("-- Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    // REST server
    let rest_app = router(AppState {
        ingestion: service.clone(),
    });
    let rest_listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    let rest_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let rest_server = async move {
        axum::serve(rest_listener, rest_app)
            .with_graceful_shutdown(rest_shutdown)
            .await
    };

    // Instrument listener
    let instrument_server =
        lis_listener::run(listener_cfg, service, wait_for_shutdown(shutdown_rx));

    // Run both
    let (rest_result, instrument_result) = tokio::join!(rest_server, instrument_server);
    rest_result.map_err(anyhow::Error::from)?;
    instrument_result.map_err(anyhow::Error::from)?;

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
