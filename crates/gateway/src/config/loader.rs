use std::path::Path;
use thiserror::Error;
use url::Url;

use super::types::{MAX_BACKFILL_SPAN_SECS, TelemetryConfigFile};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load telemetry configuration from a JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TelemetryConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Load configuration from a JSON string
pub fn load_config_from_str(json: &str) -> Result<TelemetryConfigFile, ConfigError> {
    let config: TelemetryConfigFile = serde_json::from_str(json)?;
    Ok(config)
}

/// Load the default embedded configuration
pub fn load_default_config() -> Result<TelemetryConfigFile, ConfigError> {
    let default_config = include_str!("telemetry_config.json");
    load_config_from_str(default_config)
}

impl TelemetryConfigFile {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url(&self.server.ws_url, &["ws", "wss"])?;
        check_url(&self.server.rest_url, &["http", "https"])?;

        let connection = &self.connection;
        if connection.backoff_base_ms == 0 || connection.backoff_base_ms > connection.backoff_cap_ms
        {
            return Err(ConfigError::Invalid(
                "backoff base must be non-zero and not above the cap".to_string(),
            ));
        }
        if connection.circuit_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        if connection.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.streams.max_entries == 0 || self.streams.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream capacity settings must be non-zero".to_string(),
            ));
        }
        if self.streams.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sweep_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.backfill.safety_margin_secs < 0 || self.backfill.max_window_secs <= 0 {
            return Err(ConfigError::Invalid(
                "backfill windows must be positive".to_string(),
            ));
        }
        if self.backfill.safety_margin_secs > MAX_BACKFILL_SPAN_SECS
            || self.backfill.max_window_secs > MAX_BACKFILL_SPAN_SECS
        {
            return Err(ConfigError::Invalid(format!(
                "backfill windows may not exceed {} seconds",
                MAX_BACKFILL_SPAN_SECS
            )));
        }
        if self.backfill.fetch_timeout_ms == 0 || self.ingestion.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "fetch timeouts must be non-zero".to_string(),
            ));
        }
        if self.backfill.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "backfill concurrency must be at least 1".to_string(),
            ));
        }

        if self.ingestion.poll_interval_ms == 0 || self.ingestion.dedup_capacity == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms and dedup_capacity must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("{}: {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "{}: expected scheme {}",
            raw,
            schemes.join(" or ")
        )));
    }
    Ok(())
}
