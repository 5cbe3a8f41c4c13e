//! The broker client boundary.
//!
//! The harness talks to a stream broker exclusively through the traits in this
//! module. A [`StreamClient`] opens [`Connection`]s; a connection manages
//! streams and creates [`Producer`]s and [`Consumer`]s bound to one stream.
//!
//! ## Confirmations
//!
//! Publishing is asynchronous. [`Producer::send`] returns as soon as the
//! message is handed to the client and yields a [`PendingConfirm`], a future
//! that resolves once the broker confirms (or rejects) the message. Callers
//! decide where to await it; nothing is hidden in a callback.
//!
//! ## Delivery
//!
//! Consumption is push-driven. The client invokes the [`MessageHandler`]
//! passed to [`Connection::new_consumer`] on its own delivery task, once per
//! message. Handlers must not block.
//!
//! ## Ownership
//!
//! Every handle is released explicitly with `close()`. Closing twice returns
//! [`ClientError::Closed`].

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Default stream protocol port.
pub const DEFAULT_PORT: u16 = 5552;

/// Broker endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Broker host name or address
    pub host: String,
    /// Broker stream port
    pub port: u16,
    /// User name
    pub username: String,
    /// Password
    #[serde(skip_serializing, default)]
    pub password: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}

impl ConnectionSettings {
    /// `host:port`, used in logs and errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Options applied when a stream is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Retention limit in bytes, `None` for the broker default.
    pub max_length_bytes: Option<u64>,
}

impl Default for StreamOptions {
    /// 5 GiB retention.
    fn default() -> Self {
        Self {
            max_length_bytes: Some(5 * 1024 * 1024 * 1024),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Producer-local, monotonically increasing id
    pub publishing_id: u64,
    /// Payload
    pub body: Bytes,
}

impl OutboundMessage {
    /// Create a message with an explicit body.
    pub fn new(publishing_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            publishing_id,
            body: body.into(),
        }
    }

    /// Create a message whose payload is the decimal id itself.
    pub fn with_id_payload(publishing_id: u64) -> Self {
        Self::new(publishing_id, publishing_id.to_string())
    }
}

/// A message handed to a consumer's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stream the message was read from
    pub stream: String,
    /// Offset of the message in the stream
    pub offset: u64,
    /// Payload
    pub body: Bytes,
}

/// Per-message callback invoked on the client's delivery task.
pub type MessageHandler = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

/// Final state of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStatus {
    /// The broker durably accepted the message.
    Confirmed,
    /// The broker (or client) reported a failure for this message.
    Rejected(String),
    /// No confirmation will ever arrive (producer closed, connection lost).
    Dropped,
}

impl ConfirmStatus {
    /// Whether the message counts as delivered to the broker.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmStatus::Confirmed)
    }
}

/// Sending half of a confirmation, held by the client implementation.
#[derive(Debug)]
pub struct ConfirmSender {
    sender: oneshot::Sender<ConfirmStatus>,
}

impl ConfirmSender {
    /// Resolve the matching [`PendingConfirm`].
    ///
    /// Resolving after the receiver was dropped is not an error.
    pub fn resolve(self, status: ConfirmStatus) {
        let _ = self.sender.send(status);
    }
}

/// Confirmation of a single published message, resolved asynchronously.
#[derive(Debug)]
pub struct PendingConfirm {
    publishing_id: u64,
    receiver: oneshot::Receiver<ConfirmStatus>,
}

impl PendingConfirm {
    /// Create a linked sender / pending pair for `publishing_id`.
    pub fn channel(publishing_id: u64) -> (ConfirmSender, PendingConfirm) {
        let (sender, receiver) = oneshot::channel();
        (
            ConfirmSender { sender },
            PendingConfirm {
                publishing_id,
                receiver,
            },
        )
    }

    /// A confirmation that is already resolved.
    pub fn resolved(publishing_id: u64, status: ConfirmStatus) -> PendingConfirm {
        let (sender, pending) = Self::channel(publishing_id);
        sender.resolve(status);
        pending
    }

    /// Id of the message this confirmation belongs to.
    pub fn publishing_id(&self) -> u64 {
        self.publishing_id
    }

    /// Wait for the broker's verdict.
    ///
    /// Returns [`ConfirmStatus::Dropped`] if the sender went away without
    /// resolving.
    pub async fn wait(self) -> ConfirmStatus {
        self.receiver.await.unwrap_or(ConfirmStatus::Dropped)
    }
}

/// Entry point of a broker client library.
#[async_trait]
pub trait StreamClient: Send + Sync + 'static {
    /// Connection type produced by this client.
    type Connection: Connection;

    /// Open a new, independent session to the broker.
    ///
    /// Each call must build a fresh connection; implementations must not hand
    /// back a handle left over from a failed attempt.
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Self::Connection>;
}

/// One logical session with the broker.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Producer type created by this connection.
    type Producer: Producer;
    /// Consumer type created by this connection.
    type Consumer: Consumer;

    /// Create a stream.
    ///
    /// Returns [`ClientError::StreamAlreadyExists`] if it is already there.
    async fn create_stream(&self, stream: &str, options: &StreamOptions) -> Result<()>;

    /// Create a producer publishing to `stream`.
    async fn new_producer(&self, stream: &str, name: &str) -> Result<Self::Producer>;

    /// Attach a consumer reading `stream` from its first offset.
    async fn new_consumer(
        &self,
        stream: &str,
        name: &str,
        handler: MessageHandler,
    ) -> Result<Self::Consumer>;

    /// Release the session.
    async fn close(&self) -> Result<()>;
}

/// Publishing handle bound to one stream.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Hand a message to the client.
    ///
    /// `Ok` means the message was accepted for publishing, not that it was
    /// confirmed; await the returned [`PendingConfirm`] for that.
    async fn send(&self, message: OutboundMessage) -> Result<PendingConfirm>;

    /// Release the producer.
    async fn close(&self) -> Result<()>;
}

/// Consuming handle bound to one stream.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Detach the handler and release the consumer.
    async fn close(&self) -> Result<()>;
}

/// Treat "already exists" as success.
pub fn ignore_already_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(ClientError::StreamAlreadyExists(_)) => Ok(()),
        other => other,
    }
}
