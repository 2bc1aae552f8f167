use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lis_core::config::{default_instrument_from_env_value, store_backend_from_env_value};
use lis_core::constants::DEFAULT_DATA_DIR;
use lis_core::{CoreConfig, IngestionService, Stores};
use lis_listener::ListenerConfig;

/// Standalone instrument listener.
///
/// # Environment Variables
/// - `LIS_LISTENER_ADDR`: listen address (default: "0.0.0.0:5001")
/// - `LIS_IDLE_TIMEOUT_SECS`: idle timeout per connection (default: 60)
/// - `LIS_FRAMING`: "per-read" (default) or "mllp"
/// - `LIS_ENCODING`: "utf-8" (default) or "latin1"
/// - `LIS_DATA_DIR`: data directory for the file store (default: "lis_data")
/// - `LIS_STORE`: "file" (default) or "memory"
/// - `LIS_DEFAULT_INSTRUMENT`: instrument id used when a message names none
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lis_listener=info".parse()?)
                .add_directive("lis_core=info".parse()?),
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

    let stores = Stores::open(&core_cfg)?;
    let service = IngestionService::new(core_cfg, stores.results);

    lis_listener::run(listener_cfg, service, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
