//! Tracing initialization.
//!
//! Log levels are controlled with `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=courier=debug,tower_http=debug`.

use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber: an `EnvFilter` plus a fmt layer, text or JSON lines.
pub fn init_telemetry(json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;
    }

    info!(json, "Telemetry initialized");
    Ok(())
}
