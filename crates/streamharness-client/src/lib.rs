//! StreamHarness Client - broker client boundary
//!
//! This crate defines the interface the harness uses to talk to a stream
//! broker, plus two implementations of it:
//!
//! - [`memory::MemoryBroker`]: an in-process broker with fault injection,
//!   used by tests and for running the harness without infrastructure
//! - [`rabbitmq::RabbitMqClient`]: RabbitMQ Streams through the
//!   `rabbitmq-stream-client` crate (feature `rabbitmq`, on by default)
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use streamharness_client::{Connection, Producer, StreamClient, OutboundMessage};
//!
//! let connection = client.connect(&ConnectionSettings::default()).await?;
//! let producer = connection.new_producer("orders", "producer-0").await?;
//!
//! let pending = producer.send(OutboundMessage::with_id_payload(0)).await?;
//! if pending.wait().await.is_confirmed() {
//!     println!("confirmed");
//! }
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! let handler: MessageHandler = Arc::new(|delivery| {
//!     println!("offset {}", delivery.offset);
//! });
//! let consumer = connection.new_consumer("orders", "consumer-0", handler).await?;
//! ```

pub mod client;
pub mod error;
pub mod memory;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;
pub mod retry;

pub use client::{
    ignore_already_exists, ConfirmSender, ConfirmStatus, Connection, ConnectionSettings, Consumer,
    Delivery, MessageHandler, OutboundMessage, PendingConfirm, Producer, StreamClient,
    StreamOptions, DEFAULT_PORT,
};
pub use error::{ClientError, Result};
pub use memory::{
    DeliveryMode, HandleKind, MemoryBroker, MemoryConnection, MemoryConsumer, MemoryProducer,
};
#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqClient;
pub use retry::{retry_with_backoff, Backoff, RetryError, RetryOutcome, RetryPolicy};
