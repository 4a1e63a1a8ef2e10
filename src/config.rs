//! Engine configuration.
//!
//! Sensible defaults, overridable in production via `PRAYOG_*` environment
//! variables.

use std::env;
use std::path::PathBuf;

use crate::constants::{AUTO_STOP_SAMPLE_FACTOR, BALANCE_WARNING_THRESHOLD};

/// Configuration for the experiment engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base path for the RocksDB store (ignored by in-memory stores)
    pub storage_path: PathBuf,
    /// Key namespace prefix in the store
    pub key_prefix: String,
    /// Auto-stop once total samples exceed this multiple of the minimum
    /// sample size while a variant is significant
    pub auto_stop_sample_factor: f64,
    /// Balance scores below this produce a recommendation warning
    pub balance_warning_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./prayog_data"),
            key_prefix: "prayog".to_string(),
            auto_stop_sample_factor: AUTO_STOP_SAMPLE_FACTOR,
            balance_warning_threshold: BALANCE_WARNING_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("PRAYOG_STORAGE_PATH") {
            if !path.trim().is_empty() {
                config.storage_path = PathBuf::from(path);
            }
        }

        if let Ok(prefix) = env::var("PRAYOG_KEY_PREFIX") {
            let prefix = prefix.trim();
            if !prefix.is_empty() && !prefix.contains(':') {
                config.key_prefix = prefix.to_string();
            } else if !prefix.is_empty() {
                tracing::warn!(
                    "PRAYOG_KEY_PREFIX must not contain ':'; keeping {}",
                    config.key_prefix
                );
            }
        }

        if let Ok(val) = env::var("PRAYOG_AUTO_STOP_FACTOR") {
            match val.parse::<f64>() {
                Ok(factor) if factor >= 1.0 => config.auto_stop_sample_factor = factor,
                _ => tracing::warn!("ignoring invalid PRAYOG_AUTO_STOP_FACTOR: {val}"),
            }
        }

        if let Ok(val) = env::var("PRAYOG_BALANCE_WARNING_THRESHOLD") {
            match val.parse::<f64>() {
                Ok(threshold) if (0.0..=1.0).contains(&threshold) => {
                    config.balance_warning_threshold = threshold
                }
                _ => tracing::warn!("ignoring invalid PRAYOG_BALANCE_WARNING_THRESHOLD: {val}"),
            }
        }

        tracing::info!(
            storage_path = %config.storage_path.display(),
            key_prefix = %config.key_prefix,
            "engine configuration loaded"
        );

        config
    }
}
