//! Shutdown coordination.
//!
//! ## Phases
//!
//! ```text
//! RUNNING ──signal──▶ DRAINING ──converged or timeout──▶ CLOSING ──▶ DONE
//! ```
//!
//! - **DRAINING**: producers are told to stop, their loops and pending
//!   confirmations are awaited, then `sent <= consumed` is polled until it
//!   holds or the drain deadline passes. The deadline covers the whole phase.
//! - **CLOSING**: every registered handle is released, producers first, then
//!   consumers, then connections. A failed release is logged and counted; the
//!   remaining releases still run.
//!
//! Shutdown never fails. What happened is described by the returned
//! [`ShutdownReport`].

use crate::counters::{CounterSnapshot, Counters};
use crate::error::HarnessError;
use crate::producer_pool::ProducerPool;
use crate::registry::{HandleRegistry, Registered};
use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use streamharness_client::{ClientError, Connection, Consumer, Producer};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle phase of the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ShutdownPhase {
    /// Producers and consumers are running
    Running,
    /// Waiting for consumers to catch up
    Draining,
    /// Releasing handles
    Closing,
    /// Everything released
    Done,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// How the drain phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainOutcome {
    /// `sent <= consumed` was observed before the deadline
    Converged,
    /// The deadline passed first
    TimedOut,
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// What started the shutdown
    pub signal: ShutdownSignal,
    /// How draining ended
    pub outcome: DrainOutcome,
    /// Counters at the end of draining
    pub snapshot: CounterSnapshot,
    /// Number of handles whose release failed
    pub cleanup_failures: usize,
    /// Time from the start of draining to DONE
    pub elapsed: Duration,
}

/// Drives the harness from RUNNING to DONE.
pub struct ShutdownCoordinator<C: Connection> {
    registry: Arc<HandleRegistry<C>>,
    counters: Arc<Counters>,
    shutdown: ShutdownHandle,
    drain_timeout: Duration,
    poll_interval: Duration,
    phase: watch::Sender<ShutdownPhase>,
}

impl<C: Connection> ShutdownCoordinator<C> {
    /// Create a coordinator in the RUNNING phase.
    pub fn new(
        registry: Arc<HandleRegistry<C>>,
        counters: Arc<Counters>,
        shutdown: ShutdownHandle,
        drain_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            registry,
            counters,
            shutdown,
            drain_timeout,
            poll_interval,
            phase,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: ShutdownPhase) {
        let previous = self.phase.send_replace(phase);
        debug!(from = %previous, to = %phase, "Shutdown phase");
    }

    /// Run the full shutdown sequence.
    ///
    /// `producers` is `None` when shutdown interrupts startup before the
    /// producer pool exists.
    pub async fn shutdown(&self, producers: Option<ProducerPool>, signal: ShutdownSignal) -> ShutdownReport {
        let started = Instant::now();
        let deadline = started + self.drain_timeout;

        self.enter(ShutdownPhase::Draining);
        info!(%signal, drain_timeout_ms = self.drain_timeout.as_millis() as u64, "Shutting down");
        self.shutdown.trigger(signal);

        if let Some(producers) = producers {
            producers.join(deadline).await;
        }

        let outcome = self.wait_for_drain(deadline).await;
        let snapshot = self.counters.snapshot();
        match outcome {
            DrainOutcome::Converged => {
                info!(
                    sent = snapshot.sent,
                    consumed = snapshot.consumed,
                    "All confirmed messages consumed"
                );
            }
            DrainOutcome::TimedOut => {
                warn!(
                    sent = snapshot.sent,
                    consumed = snapshot.consumed,
                    in_flight = snapshot.in_flight(),
                    "Drain timed out, sent and consumed counts differ"
                );
            }
        }

        self.enter(ShutdownPhase::Closing);
        let cleanup_failures = self.release_all().await;
        self.enter(ShutdownPhase::Done);

        let report = ShutdownReport {
            signal,
            outcome,
            snapshot,
            cleanup_failures,
            elapsed: started.elapsed(),
        };
        info!(
            %snapshot,
            cleanup_failures,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }

    /// Poll the counters until `sent <= consumed` or `deadline` passes.
    pub async fn wait_for_drain(&self, deadline: Instant) -> DrainOutcome {
        loop {
            let snapshot = self.counters.snapshot();
            if snapshot.is_drained() {
                return DrainOutcome::Converged;
            }

            let now = Instant::now();
            if now >= deadline {
                return DrainOutcome::TimedOut;
            }

            debug!(in_flight = snapshot.in_flight(), "Waiting for consumers");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Release every registered handle and return how many releases failed.
    ///
    /// Freezes the registry first, so handles created afterwards are never
    /// tracked. Safe to call more than once.
    pub async fn release_all(&self) -> usize {
        let handles = self.registry.freeze().await;
        if handles.is_empty() {
            return 0;
        }
        debug!(handles = handles.len(), "Releasing handles");

        let mut failures = 0;
        for producer in &handles.producers {
            failures += release(producer, |p| async move { p.close().await }).await;
        }
        for consumer in &handles.consumers {
            failures += release(consumer, |c| async move { c.close().await }).await;
        }
        for connection in &handles.connections {
            failures += release(connection, |c| async move { c.close().await }).await;
        }
        failures
    }
}

async fn release<T, F, Fut>(entry: &Registered<T>, close: F) -> usize
where
    F: FnOnce(Arc<T>) -> Fut,
    Fut: std::future::Future<Output = Result<(), ClientError>>,
{
    match close(Arc::clone(&entry.handle)).await {
        Ok(()) => {
            debug!(resource = %entry.name, "Released");
            0
        }
        Err(source) => {
            let err = HarnessError::Cleanup {
                resource: entry.name.clone(),
                source,
            };
            warn!(error = %err, "Cleanup failed");
            1
        }
    }
}
