//! In-process stream broker.
//!
//! `MemoryBroker` implements the client traits against an in-memory,
//! append-only log per stream. It exists so the harness can be exercised
//! end-to-end without a running broker, and it exposes fault-injection knobs
//! for the failure paths the harness has to survive:
//!
//! - `fail_next_connects(n)`: the next `n` connects fail with a retryable error
//! - `drop_confirmations(true)`: sends are appended but never confirmed
//! - `fail_sends(true)`: sends are rejected before reaching the log
//! - `pause_delivery(true)`: consumers stop receiving until resumed
//! - `fail_closes(true)`: every `close()` reports an error (after releasing)
//!
//! ## Delivery modes
//!
//! ```text
//!             log: [m0, m1, m2, m3, ...]
//!
//! Shared:     one cursor for the stream, each message goes to exactly one
//!             attached consumer (competing consumers)
//!
//! Broadcast:  one cursor per consumer, every consumer sees every message
//!             (stream semantics)
//! ```
//!
//! Consumers start at offset 0, so messages published before a consumer
//! attaches are still delivered.

use crate::client::{
    ConfirmStatus, Connection, ConnectionSettings, Consumer, Delivery, MessageHandler,
    OutboundMessage, PendingConfirm, Producer, StreamClient, StreamOptions,
};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// How messages of a stream are distributed among its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Each message is delivered to exactly one consumer.
    #[default]
    Shared,
    /// Each message is delivered to every consumer.
    Broadcast,
}

/// Kind of handle recorded in the close log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// A producer handle
    Producer,
    /// A consumer handle
    Consumer,
    /// A connection handle
    Connection,
}

struct MemoryStream {
    name: String,
    log: RwLock<Vec<Bytes>>,
    appended: Notify,
    shared_cursor: AtomicUsize,
}

impl MemoryStream {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: RwLock::new(Vec::new()),
            appended: Notify::new(),
            shared_cursor: AtomicUsize::new(0),
        }
    }

    async fn append(&self, body: Bytes) -> u64 {
        let offset = {
            let mut log = self.log.write().await;
            log.push(body);
            (log.len() - 1) as u64
        };
        self.appended.notify_waiters();
        offset
    }

    /// Claim the next undelivered message on the shared cursor.
    async fn claim_shared(&self) -> Option<(u64, Bytes)> {
        let log = self.log.read().await;
        loop {
            let idx = self.shared_cursor.load(Ordering::SeqCst);
            if idx >= log.len() {
                return None;
            }
            if self
                .shared_cursor
                .compare_exchange(idx, idx + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some((idx as u64, log[idx].clone()));
            }
        }
    }

    async fn read_at(&self, idx: usize) -> Option<Bytes> {
        self.log.read().await.get(idx).cloned()
    }
}

struct BrokerState {
    streams: RwLock<HashMap<String, Arc<MemoryStream>>>,
    delivery_mode: DeliveryMode,
    credentials: (String, String),

    connect_attempts: AtomicUsize,
    connect_failures: AtomicUsize,
    drop_confirms: AtomicBool,
    fail_sends: AtomicBool,
    fail_closes: AtomicBool,
    paused: watch::Sender<bool>,

    connections_opened: AtomicUsize,
    confirmed_sends: AtomicU64,
    close_log: Mutex<Vec<(HandleKind, String)>>,
}

impl BrokerState {
    fn record_close(&self, kind: HandleKind, name: &str) {
        if let Ok(mut log) = self.close_log.lock() {
            log.push((kind, name.to_string()));
        }
    }

    fn close_result(&self, what: &str) -> Result<()> {
        if self.fail_closes.load(Ordering::SeqCst) {
            Err(ClientError::Close(what.to_string(), "injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-process broker implementing [`StreamClient`].
///
/// Cloning is cheap; all clones share the same streams and knobs.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DeliveryMode::default())
    }
}

impl MemoryBroker {
    /// Create a broker accepting the default `guest`/`guest` credentials.
    pub fn new(delivery_mode: DeliveryMode) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(BrokerState {
                streams: RwLock::new(HashMap::new()),
                delivery_mode,
                credentials: ("guest".to_string(), "guest".to_string()),
                connect_attempts: AtomicUsize::new(0),
                connect_failures: AtomicUsize::new(0),
                drop_confirms: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                fail_closes: AtomicBool::new(false),
                paused,
                connections_opened: AtomicUsize::new(0),
                confirmed_sends: AtomicU64::new(0),
                close_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next `count` connect attempts fail with a connection error.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Stop (or resume) confirming published messages.
    pub fn drop_confirmations(&self, drop: bool) {
        self.state.drop_confirms.store(drop, Ordering::SeqCst);
    }

    /// Reject (or accept again) every send.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make every `close()` report an error.
    pub fn fail_closes(&self, fail: bool) {
        self.state.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Stall (or resume) delivery to all consumers.
    pub fn pause_delivery(&self, paused: bool) {
        self.state.paused.send_replace(paused);
    }

    /// Number of `connect` calls, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of successfully opened connections.
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Number of sends the broker confirmed.
    pub fn confirmed_sends(&self) -> u64 {
        self.state.confirmed_sends.load(Ordering::SeqCst)
    }

    /// Whether `stream` exists.
    pub async fn has_stream(&self, stream: &str) -> bool {
        self.state.streams.read().await.contains_key(stream)
    }

    /// Number of messages appended to `stream`.
    pub async fn stream_len(&self, stream: &str) -> usize {
        match self.state.streams.read().await.get(stream) {
            Some(s) => s.log.read().await.len(),
            None => 0,
        }
    }

    /// Payloads stored in `stream`, in offset order.
    pub async fn stream_contents(&self, stream: &str) -> Vec<Bytes> {
        match self.state.streams.read().await.get(stream) {
            Some(s) => s.log.read().await.clone(),
            None => Vec::new(),
        }
    }

    /// Every handle closed so far, in close order.
    pub fn close_log(&self) -> Vec<(HandleKind, String)> {
        self.state
            .close_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamClient for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<MemoryConnection> {
        let attempt = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let injected = self
            .state
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(attempt, address = %settings.address(), "Injected connect failure");
            return Err(ClientError::Connection(
                settings.address(),
                "connection refused".to_string(),
            ));
        }

        let (user, password) = &self.state.credentials;
        if &settings.username != user || &settings.password != password {
            return Err(ClientError::Authentication(settings.username.clone()));
        }

        let id = self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            state: Arc::clone(&self.state),
            name: format!("connection-{id}"),
            closed: AtomicBool::new(false),
        })
    }
}

/// Session with a [`MemoryBroker`].
pub struct MemoryConnection {
    state: Arc<BrokerState>,
    name: String,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Broker-assigned connection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed(self.name.clone()));
        }
        Ok(())
    }

    async fn stream(&self, stream: &str) -> Option<Arc<MemoryStream>> {
        self.state.streams.read().await.get(stream).cloned()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    async fn create_stream(&self, stream: &str, _options: &StreamOptions) -> Result<()> {
        self.ensure_open()?;
        let mut streams = self.state.streams.write().await;
        if streams.contains_key(stream) {
            return Err(ClientError::StreamAlreadyExists(stream.to_string()));
        }
        streams.insert(stream.to_string(), Arc::new(MemoryStream::new(stream)));
        debug!(stream, "Created stream");
        Ok(())
    }

    async fn new_producer(&self, stream: &str, name: &str) -> Result<MemoryProducer> {
        self.ensure_open()?;
        let target = self.stream(stream).await.ok_or_else(|| {
            ClientError::ProducerCreate(name.to_string(), format!("stream '{stream}' does not exist"))
        })?;

        Ok(MemoryProducer {
            state: Arc::clone(&self.state),
            stream: target,
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    async fn new_consumer(
        &self,
        stream: &str,
        name: &str,
        handler: MessageHandler,
    ) -> Result<MemoryConsumer> {
        self.ensure_open()?;
        let source = self.stream(stream).await.ok_or_else(|| {
            ClientError::ConsumerCreate(name.to_string(), format!("stream '{stream}' does not exist"))
        })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(delivery_loop(
            source,
            self.state.delivery_mode,
            self.state.paused.subscribe(),
            stop_rx,
            handler,
        ));

        Ok(MemoryConsumer {
            state: Arc::clone(&self.state),
            name: name.to_string(),
            stop: stop_tx,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed(self.name.clone()));
        }
        self.state.record_close(HandleKind::Connection, &self.name);
        self.state.close_result(&self.name)
    }
}

/// Producer on a [`MemoryBroker`] stream.
pub struct MemoryProducer {
    state: Arc<BrokerState>,
    stream: Arc<MemoryStream>,
    name: String,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, message: OutboundMessage) -> Result<PendingConfirm> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed(self.name.clone()));
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Send(format!(
                "{}: injected send failure for message {}",
                self.name, message.publishing_id
            )));
        }

        let offset = self.stream.append(message.body).await;
        trace!(producer = %self.name, stream = %self.stream.name, offset, "Appended message");

        let (sender, pending) = PendingConfirm::channel(message.publishing_id);
        if self.state.drop_confirms.load(Ordering::SeqCst) {
            drop(sender);
        } else {
            self.state.confirmed_sends.fetch_add(1, Ordering::SeqCst);
            sender.resolve(ConfirmStatus::Confirmed);
        }
        Ok(pending)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed(self.name.clone()));
        }
        self.state.record_close(HandleKind::Producer, &self.name);
        self.state.close_result(&self.name)
    }
}

/// Consumer on a [`MemoryBroker`] stream.
pub struct MemoryConsumer {
    state: Arc<BrokerState>,
    name: String,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed(self.name.clone()));
        }
        self.stop.send_replace(true);
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state.record_close(HandleKind::Consumer, &self.name);
        self.state.close_result(&self.name)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn delivery_loop(
    stream: Arc<MemoryStream>,
    mode: DeliveryMode,
    mut paused: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
    handler: MessageHandler,
) {
    let mut cursor = 0usize;

    loop {
        if *stop.borrow() {
            break;
        }

        if *paused.borrow() {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
            continue;
        }

        // Register interest before draining so an append racing with the
        // drain still wakes us.
        let notified = stream.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        loop {
            if *paused.borrow() || *stop.borrow() {
                break;
            }
            let next = match mode {
                DeliveryMode::Shared => stream.claim_shared().await,
                DeliveryMode::Broadcast => match stream.read_at(cursor).await {
                    Some(body) => {
                        cursor += 1;
                        Some(((cursor - 1) as u64, body))
                    }
                    None => None,
                },
            };
            let Some((offset, body)) = next else {
                break;
            };
            handler(Delivery {
                stream: stream.name.clone(),
                offset,
                body,
            });
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = stop.changed() => break,
            _ = paused.changed() => {}
        }
    }
}
