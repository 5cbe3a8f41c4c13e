//! Registry of live client handles.
//!
//! Every producer, consumer and connection the harness opens is registered
//! here so shutdown can release them in a fixed order. Once shutdown takes
//! the handles out with [`HandleRegistry::freeze`], late registrations are
//! refused and the handle is dropped unregistered.

use crate::error::{HarnessError, Result};
use std::sync::Arc;
use streamharness_client::Connection;
use tokio::sync::Mutex;

/// A named handle.
pub struct Registered<T> {
    /// Name used in logs
    pub name: String,
    /// Shared handle
    pub handle: Arc<T>,
}

impl<T> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handle: Arc::clone(&self.handle),
        }
    }
}

/// Handles taken out of the registry, in registration order.
pub struct RegisteredHandles<C: Connection> {
    /// Producers
    pub producers: Vec<Registered<C::Producer>>,
    /// Consumers
    pub consumers: Vec<Registered<C::Consumer>>,
    /// Connections (including any still held by a pool)
    pub connections: Vec<Registered<C>>,
}

impl<C: Connection> RegisteredHandles<C> {
    /// Total number of handles.
    pub fn len(&self) -> usize {
        self.producers.len() + self.consumers.len() + self.connections.len()
    }

    /// Whether nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Inner<C: Connection> {
    frozen: bool,
    handles: RegisteredHandles<C>,
}

/// Shared registry of producers, consumers and connections.
pub struct HandleRegistry<C: Connection> {
    inner: Mutex<Inner<C>>,
}

impl<C: Connection> Default for HandleRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> HandleRegistry<C> {
    /// Empty, open registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                frozen: false,
                handles: RegisteredHandles {
                    producers: Vec::new(),
                    consumers: Vec::new(),
                    connections: Vec::new(),
                },
            }),
        }
    }

    /// Register a connection and get back a shared handle to it.
    pub async fn register_connection(&self, name: &str, connection: C) -> Result<Arc<C>> {
        let mut inner = self.inner.lock().await;
        if inner.frozen {
            return Err(HarnessError::RegistryFrozen(name.to_string()));
        }
        let handle = Arc::new(connection);
        inner.handles.connections.push(Registered {
            name: name.to_string(),
            handle: Arc::clone(&handle),
        });
        Ok(handle)
    }

    /// Register a producer.
    pub async fn register_producer(
        &self,
        name: &str,
        producer: C::Producer,
    ) -> Result<Arc<C::Producer>> {
        let mut inner = self.inner.lock().await;
        if inner.frozen {
            return Err(HarnessError::RegistryFrozen(name.to_string()));
        }
        let handle = Arc::new(producer);
        inner.handles.producers.push(Registered {
            name: name.to_string(),
            handle: Arc::clone(&handle),
        });
        Ok(handle)
    }

    /// Register a consumer.
    pub async fn register_consumer(
        &self,
        name: &str,
        consumer: C::Consumer,
    ) -> Result<Arc<C::Consumer>> {
        let mut inner = self.inner.lock().await;
        if inner.frozen {
            return Err(HarnessError::RegistryFrozen(name.to_string()));
        }
        let handle = Arc::new(consumer);
        inner.handles.consumers.push(Registered {
            name: name.to_string(),
            handle: Arc::clone(&handle),
        });
        Ok(handle)
    }

    /// Stop accepting registrations and take every handle.
    ///
    /// A second call returns an empty set.
    pub async fn freeze(&self) -> RegisteredHandles<C> {
        let mut inner = self.inner.lock().await;
        inner.frozen = true;
        RegisteredHandles {
            producers: std::mem::take(&mut inner.handles.producers),
            consumers: std::mem::take(&mut inner.handles.consumers),
            connections: std::mem::take(&mut inner.handles.connections),
        }
    }

    /// Whether [`HandleRegistry::freeze`] was called.
    pub async fn is_frozen(&self) -> bool {
        self.inner.lock().await.frozen
    }

    /// Number of handles currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamharness_client::{
        ConnectionSettings, MemoryBroker, MemoryConnection, StreamClient, StreamOptions,
    };

    async fn open(broker: &MemoryBroker) -> MemoryConnection {
        broker.connect(&ConnectionSettings::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_register_and_freeze() {
        let broker = MemoryBroker::default();
        let registry = HandleRegistry::<MemoryConnection>::new();

        let connection = registry
            .register_connection("producer-0", open(&broker).await)
            .await
            .unwrap();
        connection
            .create_stream("orders", &StreamOptions::default())
            .await
            .unwrap();
        let producer = connection.new_producer("orders", "producer-0").await.unwrap();
        registry.register_producer("producer-0", producer).await.unwrap();
        assert_eq!(registry.len().await, 2);

        let handles = registry.freeze().await;
        assert_eq!(handles.producers.len(), 1);
        assert_eq!(handles.connections.len(), 1);
        assert_eq!(handles.producers[0].name, "producer-0");
        assert!(handles.consumers.is_empty());

        assert!(registry.is_frozen().await);
        assert_eq!(registry.len().await, 0);
        assert!(registry.freeze().await.is_empty());
    }

    #[tokio::test]
    async fn test_frozen_registry_refuses_late_handles() {
        let broker = MemoryBroker::default();
        let registry = HandleRegistry::<MemoryConnection>::new();
        registry.freeze().await;

        let err = registry
            .register_connection("consumer-3", open(&broker).await)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::RegistryFrozen(name) if name == "consumer-3"));
    }
}
