//! Consumer pool.
//!
//! Every consumer attaches to the stream from its first offset on its own
//! connection. Deliveries are pushed by the client; the handler only bumps
//! the shared `consumed` counter.

use crate::counters::Counters;
use crate::error::Result;
use crate::registry::HandleRegistry;
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use streamharness_client::{Connection, Delivery, MessageHandler, StreamClient};
use tracing::{info, trace};

/// Attached consumers.
#[derive(Debug)]
pub struct ConsumerPool {
    names: Vec<String>,
}

impl ConsumerPool {
    /// Attach `consumers` consumers to `stream`.
    ///
    /// Any failure is fatal; consumers already attached stay registered.
    pub async fn start<S: StreamClient>(
        stream: &str,
        consumers: usize,
        supervisor: &ConnectionSupervisor<S>,
        registry: &HandleRegistry<S::Connection>,
        counters: &Arc<Counters>,
    ) -> Result<Self> {
        let mut names = Vec::with_capacity(consumers);

        for i in 0..consumers {
            let name = format!("consumer-{i}");

            let connection = supervisor.connect(&name).await?;
            let connection = registry
                .register_connection(&format!("{name}/connection"), connection)
                .await?;
            let consumer = connection
                .new_consumer(stream, &name, counting_handler(&name, counters))
                .await?;
            registry.register_consumer(&name, consumer).await?;

            info!(consumer = %name, stream, "Consumer attached");
            names.push(name);
        }

        Ok(Self { names })
    }

    /// Names of the attached consumers.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of consumers.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no consumer is attached.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn counting_handler(name: &str, counters: &Arc<Counters>) -> MessageHandler {
    let name = name.to_string();
    let counters = Arc::clone(counters);
    Arc::new(move |delivery: Delivery| {
        let consumed = counters.record_consumed();
        trace!(consumer = %name, offset = delivery.offset, consumed, "Delivered");
    })
}
