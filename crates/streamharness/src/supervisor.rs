//! Connection establishment with bounded retry.

use crate::error::{HarnessError, Result};
use std::sync::Arc;
use streamharness_client::{
    retry_with_backoff, ConnectionSettings, RetryOutcome, RetryPolicy, StreamClient,
};
use tracing::{error, info};

/// Opens broker connections, retrying transient failures.
///
/// Every attempt builds a fresh connection through the client; a failed
/// attempt leaves nothing behind to reuse.
pub struct ConnectionSupervisor<S: StreamClient> {
    client: Arc<S>,
    settings: ConnectionSettings,
    policy: RetryPolicy,
}

impl<S: StreamClient> Clone for ConnectionSupervisor<S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            settings: self.settings.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<S: StreamClient> ConnectionSupervisor<S> {
    /// Create a supervisor for one broker endpoint.
    pub fn new(client: Arc<S>, settings: ConnectionSettings, policy: RetryPolicy) -> Self {
        Self {
            client,
            settings,
            policy,
        }
    }

    /// Endpoint this supervisor connects to.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect, returning the connection together with the attempt count.
    ///
    /// `purpose` names the component the connection is for and only shows up
    /// in logs.
    pub async fn connect_counted(&self, purpose: &str) -> Result<RetryOutcome<S::Connection>> {
        let address = self.settings.address();
        let max_attempts = self.policy.max_attempts.max(1);

        let result = retry_with_backoff(&self.policy, |attempt| {
            info!(
                purpose,
                address = %address,
                attempt,
                max_attempts,
                "Attempting to connect"
            );
            self.client.connect(&self.settings)
        })
        .await;

        match result {
            Ok(outcome) => {
                info!(
                    purpose,
                    address = %address,
                    attempts = outcome.attempts,
                    "Connected"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    purpose,
                    address = %address,
                    attempts = e.attempts,
                    error = %e.source,
                    "Giving up on connection"
                );
                Err(HarnessError::Connection {
                    address,
                    attempts: e.attempts,
                    source: e.source,
                })
            }
        }
    }

    /// Connect, discarding the attempt count.
    pub async fn connect(&self, purpose: &str) -> Result<S::Connection> {
        self.connect_counted(purpose).await.map(|o| o.value)
    }
}
