//! Error types for stream client operations.
//!
//! Every call across the client boundary (connect, stream creation, producer
//! and consumer lifecycle, publishing) reports failures through [`ClientError`].
//! Adapters translate their library-specific errors into these variants so the
//! harness never depends on a particular broker client.
//!
//! ## Error Handling Strategy
//!
//! - **Retriable errors**: `Connection`
//! - **Idempotency signals**: `StreamAlreadyExists` (not a failure for callers
//!   that only need the stream to exist)
//! - **Fatal errors**: `Authentication`, `Stream`, `ProducerCreate`, `ConsumerCreate`
//! - **Per-message errors**: `Send`
//! - **Teardown errors**: `Close`, `Closed`
//!
//! ## Examples
//!
//! ```ignore
//! use streamharness_client::ClientError;
//!
//! match connection.create_stream("orders", &StreamOptions::default()).await {
//!     Ok(()) | Err(ClientError::StreamAlreadyExists(_)) => {}
//!     Err(e) => return Err(e),
//! }
//! ```

use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type for operations against a stream broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Failed to establish a session with the broker.
    ///
    /// Contains the broker address and the underlying error message.
    ///
    /// ## Causes
    /// - Broker is down or still starting
    /// - Network partition
    /// - Wrong host/port
    ///
    /// ## Resolution
    /// - Callers are expected to retry with a fresh connection attempt
    #[error("Failed to connect to broker at {0}: {1}")]
    Connection(String, String),

    /// The broker rejected the credentials.
    ///
    /// Retrying with the same credentials will not succeed.
    #[error("Authentication failed for user '{0}'")]
    Authentication(String),

    /// The stream already exists.
    ///
    /// Returned by `create_stream` so callers can treat creation as idempotent.
    #[error("Stream '{0}' already exists")]
    StreamAlreadyExists(String),

    /// Stream management operation failed for any other reason.
    #[error("Stream '{0}' error: {1}")]
    Stream(String, String),

    /// Could not create a producer on the stream.
    #[error("Failed to create producer '{0}': {1}")]
    ProducerCreate(String, String),

    /// Could not create a consumer on the stream.
    #[error("Failed to create consumer '{0}': {1}")]
    ConsumerCreate(String, String),

    /// Publishing a single message failed before it reached the broker.
    #[error("Send failed: {0}")]
    Send(String),

    /// Releasing a connection, producer or consumer failed.
    #[error("Failed to close {0}: {1}")]
    Close(String, String),

    /// The handle was already closed.
    #[error("{0} is closed")]
    Closed(String),
}

impl ClientError {
    /// Whether a new attempt of the same operation may succeed.
    ///
    /// Only connection failures are transient. Authentication failures and
    /// every non-connect error are permanent from the caller's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection(..))
    }
}
