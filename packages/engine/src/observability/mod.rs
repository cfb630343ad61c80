// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `tracing-subscriber` with an env filter (`RUST_LOG`,
//!   default `info`), text or JSON output
//! - **Metrics**: optional Prometheus scrape endpoint

use crate::utils::config::LogFormat;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Metric names
pub mod metrics {
    pub const ENVELOPES_SENT: &str = "dspace_envelopes_sent_total";
    pub const ENVELOPES_RECEIVED: &str = "dspace_envelopes_received_total";
    pub const ENVELOPES_FORWARDED: &str = "dspace_envelopes_forwarded_total";
    pub const EXCHANGE_BYTES: &str = "dspace_exchange_bytes_total";
    pub const HALO_SYNCS: &str = "dspace_halo_syncs_total";
    pub const REBALANCES: &str = "dspace_rebalances_total";
    pub const STEP_COST: &str = "dspace_step_cost_seconds";
    pub const IMBALANCE: &str = "dspace_load_imbalance";
    pub const LOCAL_ENTITIES: &str = "dspace_local_entities";
    pub const REGISTRY_RETRIES: &str = "dspace_registry_retries_total";
}

/// Install the global tracing subscriber.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

/// Start the Prometheus exporter when an address is configured
pub fn init_metrics(address: Option<&str>) -> Result<()> {
    let Some(address) = address else {
        return Ok(());
    };
    let address: SocketAddr = address
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid metrics address {}: {}", address, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| EngineError::Config(format!("failed to start metrics exporter: {}", e)))?;
    info!("Prometheus metrics listening on {}", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        assert!(init_tracing(LogFormat::Text).is_ok());
        assert!(init_tracing(LogFormat::Json).is_ok());
    }

    #[test]
    fn test_metrics_disabled_or_invalid() {
        assert!(init_metrics(None).is_ok());
        assert!(matches!(init_metrics(Some("not an address")), Err(EngineError::Config(_))));
    }
}
