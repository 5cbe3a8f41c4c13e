//! StreamHarness binary
//!
//! Runs two producers and five consumers against a RabbitMQ stream until
//! SIGINT/SIGTERM, then drains and exits.
//!
//! ## Configuration
//!
//! - `BROKER_HOST`: broker host (default: localhost)
//! - `BROKER_PORT`: broker stream port (default: 5552)
//!
//! ## Logging
//!
//! Controlled via `RUST_LOG` (default: `info`):
//! ```bash
//! RUST_LOG=debug cargo run -p streamharness
//! ```
//!
//! Exits non-zero if the broker cannot be reached within the retry budget or
//! the stream cannot be provisioned.

use anyhow::{Context, Result};
use streamharness::{shutdown_signal, DrainOutcome, Harness, HarnessConfig};
use streamharness_client::RabbitMqClient;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = HarnessConfig::from_env().context("Failed to load configuration")?;
    info!(
        config = %serde_json::to_string(&config).context("Failed to serialize configuration")?,
        "Configuration loaded"
    );

    let report = Harness::new(RabbitMqClient, config)
        .run_until(shutdown_signal())
        .await
        .context("Harness failed")?;

    if report.outcome == DrainOutcome::TimedOut {
        warn!(in_flight = report.snapshot.in_flight(), "Exited before consumers caught up");
    }
    if report.cleanup_failures > 0 {
        warn!(failures = report.cleanup_failures, "Some client handles failed to close");
    }
    info!("{}", report.snapshot);
    Ok(())
}
