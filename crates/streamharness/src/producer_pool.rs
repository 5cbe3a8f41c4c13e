//! Producer pool.
//!
//! Each producer gets its own connection and runs an independent loop:
//!
//! ```text
//!  loop ──send(id)──▶ client ──PendingConfirm──▶ confirm task
//!    │                                              │
//!    │ sleep(send_interval) or shutdown             ├─ Confirmed ──▶ sent += 1
//!    ▼                                              └─ otherwise ──▶ failed += 1
//! ```
//!
//! Ids start at 0 and increase by one per send attempt; the payload of each
//! message is its id in decimal. `sent` only counts broker confirmations, so
//! it never exceeds the number of messages actually accepted by the broker.
//!
//! Loops stop cooperatively: the shutdown flag is checked before every send
//! and interrupts the pause between sends.

use crate::counters::Counters;
use crate::error::{HarnessError, Result};
use crate::registry::HandleRegistry;
use crate::shutdown::ShutdownHandle;
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use std::time::Duration;
use streamharness_client::{
    ConfirmStatus, Connection, OutboundMessage, PendingConfirm, Producer, StreamClient,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Maximum number of unresolved confirmations queued per producer.
pub const CONFIRM_CHANNEL_CAPACITY: usize = 1024;

/// Settings for [`ProducerPool::start`].
#[derive(Debug, Clone)]
pub struct ProducerPoolConfig {
    /// Stream to publish to
    pub stream: String,
    /// Number of producers
    pub producers: usize,
    /// Pause between sends
    pub send_interval: Duration,
    /// Per-producer send limit
    pub messages_per_producer: Option<u64>,
}

struct Worker {
    name: String,
    send_loop: JoinHandle<()>,
    confirms: JoinHandle<()>,
}

impl Worker {
    /// Abort both tasks and wait until they are gone.
    async fn abort(mut self) {
        self.send_loop.abort();
        self.confirms.abort();
        let _ = (&mut self.send_loop).await;
        let _ = (&mut self.confirms).await;
        debug!(producer = %self.name, "Producer aborted");
    }
}

// A pool dropped before `join` (startup interrupted) must not leave loops behind.
impl Drop for Worker {
    fn drop(&mut self) {
        self.send_loop.abort();
        self.confirms.abort();
    }
}

/// Running producer loops.
pub struct ProducerPool {
    workers: Vec<Worker>,
    active: watch::Receiver<usize>,
}

impl ProducerPool {
    /// Connect every producer and start its loop.
    ///
    /// Producers are created one after another; the first failure aborts
    /// startup and stops the loops already running. Handles created before
    /// the failure stay in `registry` and are released by whoever shuts the
    /// harness down. Dropping the returned future part way has the same
    /// effect on the loops.
    pub async fn start<S: StreamClient>(
        config: &ProducerPoolConfig,
        supervisor: &ConnectionSupervisor<S>,
        registry: &HandleRegistry<S::Connection>,
        counters: &Arc<Counters>,
        shutdown: &ShutdownHandle,
    ) -> Result<Self> {
        let (active_tx, active) = watch::channel(config.producers);
        let active_tx = Arc::new(active_tx);
        let mut workers: Vec<Worker> = Vec::with_capacity(config.producers);

        for i in 0..config.producers {
            let name = format!("producer-{i}");

            let created = async {
                let connection = supervisor.connect(&name).await?;
                let connection = registry
                    .register_connection(&format!("{name}/connection"), connection)
                    .await?;
                let producer = connection.new_producer(&config.stream, &name).await?;
                registry.register_producer(&name, producer).await
            }
            .await;
            let producer = match created {
                Ok(producer) => producer,
                Err(e) => {
                    warn!(producer = %name, started = workers.len(), "Producer startup failed, stopping running producers");
                    for worker in workers {
                        worker.abort().await;
                    }
                    return Err(e);
                }
            };

            let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_CHANNEL_CAPACITY);
            let confirms = tokio::spawn(drain_confirms(
                name.clone(),
                confirm_rx,
                Arc::clone(counters),
            ));

            let send_loop = tokio::spawn(send_loop(
                SendLoop {
                    name: name.clone(),
                    producer,
                    counters: Arc::clone(counters),
                    confirms: confirm_tx,
                    interval: config.send_interval,
                    limit: config.messages_per_producer,
                    shutdown: shutdown.clone(),
                },
                Arc::clone(&active_tx),
            ));

            info!(producer = %name, stream = %config.stream, "Producer started");
            workers.push(Worker {
                name,
                send_loop,
                confirms,
            });
        }

        Ok(Self { workers, active })
    }

    /// Number of producers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no producers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Completes once every producer loop has stopped.
    ///
    /// Never completes for an empty pool.
    pub async fn wait_idle(&self) {
        if self.workers.is_empty() {
            return std::future::pending().await;
        }
        let mut active = self.active.clone();
        if active.wait_for(|n| *n == 0).await.is_err() {
            // all loops are gone, with or without decrementing
            debug!("Producer activity channel closed");
        }
    }

    /// Wait for loops and outstanding confirmations, up to `deadline`.
    ///
    /// Call after shutdown was triggered. Anything still running at the
    /// deadline is aborted.
    pub async fn join(self, deadline: Instant) {
        let mut workers = self.workers;
        for worker in &mut workers {
            match tokio::time::timeout_at(deadline, &mut worker.send_loop).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(producer = %worker.name, error = %e, "Producer loop panicked"),
                Err(_) => {
                    warn!(producer = %worker.name, "Producer loop did not stop before the drain deadline");
                    worker.send_loop.abort();
                }
            }
        }

        for worker in &mut workers {
            match tokio::time::timeout_at(deadline, &mut worker.confirms).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(producer = %worker.name, error = %e, "Confirmation task panicked"),
                Err(_) => {
                    warn!(producer = %worker.name, "Confirmations still outstanding at the drain deadline");
                    worker.confirms.abort();
                }
            }
        }
    }
}

struct SendLoop<P> {
    name: String,
    producer: Arc<P>,
    counters: Arc<Counters>,
    confirms: mpsc::Sender<PendingConfirm>,
    interval: Duration,
    limit: Option<u64>,
    shutdown: ShutdownHandle,
}

async fn send_loop<P: Producer>(mut state: SendLoop<P>, active: Arc<watch::Sender<usize>>) {
    let mut next_id: u64 = 0;

    loop {
        if state.shutdown.is_shutdown() {
            break;
        }
        if state.limit.is_some_and(|limit| next_id >= limit) {
            info!(producer = %state.name, messages = next_id, "Message limit reached");
            break;
        }

        let publishing_id = next_id;
        next_id += 1;

        match state
            .producer
            .send(OutboundMessage::with_id_payload(publishing_id))
            .await
        {
            Ok(pending) => {
                state.counters.record_published();
                if state.confirms.send(pending).await.is_err() {
                    state.counters.record_failed();
                    warn!(producer = %state.name, "Confirmation task gone, stopping producer");
                    break;
                }
            }
            Err(source) => {
                state.counters.record_failed();
                let err = HarnessError::Send {
                    producer: state.name.clone(),
                    publishing_id,
                    source,
                };
                debug!(error = %err, "Message dropped");
            }
        }

        tokio::select! {
            _ = state.shutdown.wait() => break,
            _ = tokio::time::sleep(state.interval) => {}
        }
    }

    debug!(producer = %state.name, attempted = next_id, "Producer loop stopped");
    active.send_modify(|n| *n = n.saturating_sub(1));
}

async fn drain_confirms(
    name: String,
    mut pending: mpsc::Receiver<PendingConfirm>,
    counters: Arc<Counters>,
) {
    while let Some(confirm) = pending.recv().await {
        let publishing_id = confirm.publishing_id();
        match confirm.wait().await {
            ConfirmStatus::Confirmed => {
                counters.record_sent();
            }
            status => {
                counters.record_failed();
                debug!(producer = %name, publishing_id, ?status, "Message not confirmed");
            }
        }
    }
}
