//! Logging initialization for embedding applications.
//!
//! The engine itself only emits through `tracing` macros; hosts that do not
//! already install a subscriber can call `init_tracing()` once at startup.
//!
//! Configuration via environment variables:
//! - RUST_LOG: log level filter (default: info)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber with an env-driven filter. Returns an error if
/// a global subscriber is already set.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    tracing::info!("tracing initialized");
    Ok(())
}
