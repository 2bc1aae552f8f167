//! Standalone REST API server binary.
//!
//! ## Purpose
//! Runs the HTTP ingestion server on its own.
//!
//! ## Intended use
//! This binary is useful for development and debugging when you only want the REST server (with
//! OpenAPI/Swagger UI). The workspace's main `lis-run` binary runs the instrument listener and
//! REST concurrently.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use lis_core::config::{default_instrument_from_env_value, store_backend_from_env_value};
use lis_core::constants::DEFAULT_DATA_DIR;
use lis_core::{CoreConfig, IngestionService, Stores};

/// Main entry point for the LIS REST API server
///
/// # Environment Variables
/// - `LIS_REST_ADDR`: Server address (default: "0.0.0.0:3000")
/// - `LIS_DATA_DIR`: data directory for the file store (default: "lis_data")
/// - `LIS_STORE`: "file" (default) or "memory"
/// - `LIS_DEFAULT_INSTRUMENT`: instrument id used when a payload names none
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - the configuration is invalid or the store cannot be opened,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("api_rest=info".parse()?)
                .add_directive("lis_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = std::env::var("LIS_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    tracing::info!("-- Starting LIS REST API on {}", addr);

    let cfg = Arc::new(CoreConfig::new(
        std::env::var("LIS_DATA_DIR")
            .unwrap_or_else(|_| DEFAULT_DATA_DIR.into())
            .into(),
        store_backend_from_env_value(std::env::var("LIS_STORE").ok())?,
        default_instrument_from_env_value(std::env::var("LIS_DEFAULT_INSTRUMENT").ok()),
    )?);
    let stores = Stores::open(&cfg)?;

    let app = router(AppState {
        ingestion: IngestionService::new(cfg, stores.results),
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
