//! RabbitMQ Streams adapter.
//!
//! Implements the client traits over the `rabbitmq-stream-client` crate. One
//! [`RabbitMqConnection`] wraps one `Environment`, so every producer and
//! consumer the harness creates lives on its own broker connection.
//!
//! Confirmation callbacks from the library are bridged into
//! [`PendingConfirm`] futures; the consumer stream is drained on a spawned
//! task that invokes the harness handler once per delivery.

use crate::client::{
    ConfirmStatus, Connection, ConnectionSettings, Consumer, Delivery, MessageHandler,
    OutboundMessage, PendingConfirm, Producer, StreamClient, StreamOptions,
};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rabbitmq_stream_client::error::StreamCreateError;
use rabbitmq_stream_client::types::{ByteCapacity, Message, OffsetSpecification, ResponseCode};
use rabbitmq_stream_client::{ConsumerHandle, Environment, NoDedup};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// [`StreamClient`] backed by a RabbitMQ stream broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RabbitMqClient;

#[async_trait]
impl StreamClient for RabbitMqClient {
    type Connection = RabbitMqConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<RabbitMqConnection> {
        let environment = Environment::builder()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username)
            .password(&settings.password)
            .build()
            .await
            .map_err(|e| ClientError::Connection(settings.address(), e.to_string()))?;

        debug!(address = %settings.address(), "Opened stream environment");
        Ok(RabbitMqConnection {
            address: settings.address(),
            environment: Mutex::new(Some(environment)),
        })
    }
}

/// One `Environment` (broker session).
pub struct RabbitMqConnection {
    address: String,
    environment: Mutex<Option<Environment>>,
}

impl RabbitMqConnection {
    fn closed(&self) -> ClientError {
        ClientError::Closed(format!("connection to {}", self.address))
    }
}

#[async_trait]
impl Connection for RabbitMqConnection {
    type Producer = RabbitMqProducer;
    type Consumer = RabbitMqConsumer;

    async fn create_stream(&self, stream: &str, options: &StreamOptions) -> Result<()> {
        let guard = self.environment.lock().await;
        let environment = guard.as_ref().ok_or_else(|| self.closed())?;

        let mut creator = environment.stream_creator();
        if let Some(bytes) = options.max_length_bytes {
            creator = creator.max_length(ByteCapacity::B(bytes));
        }

        match creator.create(stream).await {
            Ok(()) => Ok(()),
            Err(StreamCreateError::Create {
                status: ResponseCode::StreamAlreadyExists,
                ..
            }) => Err(ClientError::StreamAlreadyExists(stream.to_string())),
            Err(e) => Err(ClientError::Stream(stream.to_string(), e.to_string())),
        }
    }

    async fn new_producer(&self, stream: &str, name: &str) -> Result<RabbitMqProducer> {
        let guard = self.environment.lock().await;
        let environment = guard.as_ref().ok_or_else(|| self.closed())?;

        let producer = environment
            .producer()
            .build(stream)
            .await
            .map_err(|e| ClientError::ProducerCreate(name.to_string(), e.to_string()))?;

        Ok(RabbitMqProducer {
            name: name.to_string(),
            inner: Mutex::new(Some(producer)),
        })
    }

    async fn new_consumer(
        &self,
        stream: &str,
        name: &str,
        handler: MessageHandler,
    ) -> Result<RabbitMqConsumer> {
        let guard = self.environment.lock().await;
        let environment = guard.as_ref().ok_or_else(|| self.closed())?;

        let mut consumer = environment
            .consumer()
            .name(name)
            .offset(OffsetSpecification::First)
            .build(stream)
            .await
            .map_err(|e| ClientError::ConsumerCreate(name.to_string(), e.to_string()))?;
        let handle = consumer.handle();

        let stream_name = stream.to_string();
        let consumer_name = name.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let body = delivery
                            .message()
                            .data()
                            .map(Bytes::copy_from_slice)
                            .unwrap_or_default();
                        handler(Delivery {
                            stream: stream_name.clone(),
                            offset: delivery.offset(),
                            body,
                        });
                    }
                    Err(e) => {
                        warn!(consumer = %consumer_name, error = %e, "Delivery error");
                    }
                }
            }
            debug!(consumer = %consumer_name, "Delivery stream ended");
        });

        Ok(RabbitMqConsumer {
            name: name.to_string(),
            handle: Mutex::new(Some(handle)),
            task: StdMutex::new(Some(task)),
        })
    }

    async fn close(&self) -> Result<()> {
        // Dropping the environment releases its broker connection.
        match self.environment.lock().await.take() {
            Some(environment) => {
                drop(environment);
                Ok(())
            }
            None => Err(self.closed()),
        }
    }
}

/// Producer bound to one stream.
pub struct RabbitMqProducer {
    name: String,
    inner: Mutex<Option<rabbitmq_stream_client::Producer<NoDedup>>>,
}

#[async_trait]
impl Producer for RabbitMqProducer {
    async fn send(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        let guard = self.inner.lock().await;
        let producer = guard
            .as_ref()
            .ok_or_else(|| ClientError::Closed(self.name.clone()))?;

        let (sender, pending) = PendingConfirm::channel(message.publishing_id);
        // The library takes an `Fn` callback, so the one-shot sender sits in a
        // slot that the first invocation empties.
        let slot = Arc::new(StdMutex::new(Some(sender)));
        let amqp_message = Message::builder().body(message.body.to_vec()).build();

        producer
            .send(amqp_message, move |result| {
                let sender = slot.lock().ok().and_then(|mut s| s.take());
                let status = match result {
                    Ok(status) if status.confirmed() => ConfirmStatus::Confirmed,
                    Ok(_) => ConfirmStatus::Rejected("not confirmed by broker".to_string()),
                    Err(e) => ConfirmStatus::Rejected(e.to_string()),
                };
                async move {
                    if let Some(sender) = sender {
                        sender.resolve(status);
                    }
                }
            })
            .await
            .map_err(|e| ClientError::Send(e.to_string()))?;

        Ok(pending)
    }

    async fn close(&self) -> Result<()> {
        let producer = self
            .inner
            .lock()
            .await
            .take()
            .ok_or_else(|| ClientError::Closed(self.name.clone()))?;
        producer
            .close()
            .await
            .map_err(|e| ClientError::Close(self.name.clone(), e.to_string()))
    }
}

/// Consumer bound to one stream.
pub struct RabbitMqConsumer {
    name: String,
    handle: Mutex<Option<ConsumerHandle>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Consumer for RabbitMqConsumer {
    async fn close(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .await
            .take()
            .ok_or_else(|| ClientError::Closed(self.name.clone()))?;
        let result = handle
            .close()
            .await
            .map_err(|e| ClientError::Close(self.name.clone(), e.to_string()));

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
        result
    }
}
