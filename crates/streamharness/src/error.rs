//! Error types for the harness.
//!
//! ## Error Handling Strategy
//!
//! - **Fatal at startup**: `Connection` (after retries are exhausted), `Stream`,
//!   `Config`, `Client`
//! - **Per-message, never fatal**: `Send` (the message is counted as failed)
//! - **Per-resource, never fatal**: `Cleanup` (logged, remaining releases continue)

use streamharness_client::ClientError;
use thiserror::Error;

/// Convenience type alias for `Result<T, HarnessError>`.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors raised by the harness components.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The broker could not be reached within the retry budget.
    #[error("Could not connect to {address} after {attempts} attempt(s): {source}")]
    Connection {
        /// Broker address
        address: String,
        /// Attempts made before giving up
        attempts: usize,
        /// Last connection error
        #[source]
        source: ClientError,
    },

    /// The target stream could not be provisioned.
    #[error("Failed to provision stream '{stream}': {source}")]
    Stream {
        /// Stream name
        stream: String,
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// A single message could not be handed to the client.
    #[error("Send from {producer} failed for message {publishing_id}: {source}")]
    Send {
        /// Producer name
        producer: String,
        /// Id of the message that was dropped
        publishing_id: u64,
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// Releasing a producer, consumer or connection failed.
    #[error("Failed to release {resource}: {source}")]
    Cleanup {
        /// Name of the handle being released
        resource: String,
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The handle registry no longer accepts entries (shutdown started).
    #[error("Handle registry is frozen, {0} was not registered")]
    RegistryFrozen(String),

    /// Any other client failure during startup (producer/consumer creation).
    #[error(transparent)]
    Client(#[from] ClientError),
}
