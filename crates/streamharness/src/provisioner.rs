//! Stream provisioning.
//!
//! The target stream is created on a short-lived connection that is closed
//! right after, before any producer or consumer starts. An existing stream is
//! not an error, so provisioning can run any number of times.

use crate::error::{HarnessError, Result};
use crate::supervisor::ConnectionSupervisor;
use std::time::Duration;
use streamharness_client::{ignore_already_exists, Connection, StreamClient, StreamOptions};
use tracing::{debug, info, warn};

/// Create `stream` on `connection` unless it already exists.
pub async fn ensure_stream<C: Connection>(
    connection: &C,
    stream: &str,
    options: &StreamOptions,
) -> Result<()> {
    ignore_already_exists(connection.create_stream(stream, options).await).map_err(|source| {
        HarnessError::Stream {
            stream: stream.to_string(),
            source,
        }
    })
}

/// Ensures the target stream exists before the pools start.
pub struct StreamProvisioner<S: StreamClient> {
    supervisor: ConnectionSupervisor<S>,
    options: StreamOptions,
    settle_delay: Duration,
}

impl<S: StreamClient> StreamProvisioner<S> {
    /// Create a provisioner.
    pub fn new(
        supervisor: ConnectionSupervisor<S>,
        options: StreamOptions,
        settle_delay: Duration,
    ) -> Self {
        Self {
            supervisor,
            options,
            settle_delay,
        }
    }

    /// Make sure `stream` exists.
    ///
    /// Failing to close the provisioning connection is only logged.
    pub async fn provision(&self, stream: &str) -> Result<()> {
        let connection = self.supervisor.connect("provisioning").await?;

        let result = ensure_stream(&connection, stream, &self.options).await;
        if let Err(e) = connection.close().await {
            warn!(stream, error = %e, "Failed to close provisioning connection");
        }
        result?;

        info!(
            stream,
            max_length_bytes = ?self.options.max_length_bytes,
            "Stream ready"
        );

        if !self.settle_delay.is_zero() {
            debug!(stream, delay_ms = self.settle_delay.as_millis() as u64, "Waiting for stream to settle");
            tokio::time::sleep(self.settle_delay).await;
        }
        Ok(())
    }
}
