//! Harness orchestration.
//!
//! Startup order:
//!
//! 1. Provision the stream on a dedicated connection
//! 2. Attach the consumers
//! 3. Start the producers
//! 4. Start the progress reporter
//!
//! The harness then runs until the trigger future completes, a manual
//! shutdown is requested through [`Harness::shutdown_handle`], or every
//! producer stops on its own. Shutdown is delegated to the
//! [`ShutdownCoordinator`].
//!
//! A startup failure stops any producer already running, releases whatever
//! was already created and is returned as an error. A shutdown requested
//! during startup abandons the remaining steps the same way before the
//! regular shutdown sequence runs.

use crate::config::HarnessConfig;
use crate::consumer_pool::ConsumerPool;
use crate::coordinator::{ShutdownCoordinator, ShutdownPhase, ShutdownReport};
use crate::counters::Counters;
use crate::error::Result;
use crate::producer_pool::{ProducerPool, ProducerPoolConfig};
use crate::provisioner::StreamProvisioner;
use crate::registry::HandleRegistry;
use crate::reporter::ProgressReporter;
use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::supervisor::ConnectionSupervisor;
use std::future::Future;
use std::sync::Arc;
use streamharness_client::StreamClient;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The load harness, generic over the broker client.
pub struct Harness<S: StreamClient> {
    config: HarnessConfig,
    supervisor: ConnectionSupervisor<S>,
    registry: Arc<HandleRegistry<S::Connection>>,
    counters: Arc<Counters>,
    shutdown: ShutdownHandle,
    coordinator: ShutdownCoordinator<S::Connection>,
}

impl<S: StreamClient> Harness<S> {
    /// Build a harness around `client`.
    pub fn new(client: S, config: HarnessConfig) -> Self {
        let supervisor = ConnectionSupervisor::new(
            Arc::new(client),
            config.connection.clone(),
            config.retry.clone(),
        );
        let registry = Arc::new(HandleRegistry::new());
        let counters = Arc::new(Counters::new());
        let shutdown = ShutdownHandle::new();
        let coordinator = ShutdownCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&counters),
            shutdown.clone(),
            config.drain_timeout,
            config.drain_poll_interval,
        );

        Self {
            config,
            supervisor,
            registry,
            counters,
            shutdown,
            coordinator,
        }
    }

    /// Shared counters, readable while the harness runs.
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Handle that stops the harness when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Observe the shutdown phase.
    pub fn phases(&self) -> watch::Receiver<ShutdownPhase> {
        self.coordinator.subscribe()
    }

    /// Configuration in use.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run until `trigger` completes (or another shutdown source fires), then
    /// shut down.
    pub async fn run_until<F>(self, trigger: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ShutdownSignal>,
    {
        self.config.validate()?;
        info!(
            address = %self.config.connection.address(),
            stream = %self.config.stream_name,
            producers = self.config.producers,
            consumers = self.config.consumers,
            "Starting harness"
        );

        tokio::pin!(trigger);
        let mut manual = self.shutdown.clone();

        let producers = tokio::select! {
            started = self.start() => match started {
                Ok(producers) => producers,
                Err(e) => {
                    error!(error = %e, "Startup failed");
                    self.shutdown.shutdown();
                    let failures = self.coordinator.release_all().await;
                    if failures > 0 {
                        warn!(failures, "Some handles could not be released after startup failure");
                    }
                    return Err(e);
                }
            },
            signal = &mut trigger => {
                info!(%signal, "Shutdown requested during startup");
                return Ok(self.coordinator.shutdown(None, signal).await);
            }
            signal = manual.wait() => {
                info!(%signal, "Shutdown requested during startup");
                return Ok(self.coordinator.shutdown(None, signal).await);
            }
        };

        let reporter = ProgressReporter::new(Arc::clone(&self.counters), self.config.report_interval)
            .spawn(self.shutdown.clone());

        let signal = tokio::select! {
            signal = &mut trigger => signal,
            signal = manual.wait() => signal,
            _ = producers.wait_idle() => ShutdownSignal::ProducersFinished,
        };
        info!(%signal, "Shutdown requested");

        let report = self.coordinator.shutdown(Some(producers), signal).await;
        match reporter.await {
            Ok(reports) => debug!(reports, "Progress reporter stopped"),
            Err(e) => warn!(error = %e, "Progress reporter task failed"),
        }
        Ok(report)
    }

    async fn start(&self) -> Result<ProducerPool> {
        let stream = &self.config.stream_name;

        StreamProvisioner::new(
            self.supervisor.clone(),
            self.config.stream_options.clone(),
            self.config.stream_settle_delay,
        )
        .provision(stream)
        .await?;

        let consumers = ConsumerPool::start(
            stream,
            self.config.consumers,
            &self.supervisor,
            &self.registry,
            &self.counters,
        )
        .await?;

        let producers = ProducerPool::start(
            &ProducerPoolConfig {
                stream: stream.clone(),
                producers: self.config.producers,
                send_interval: self.config.send_interval,
                messages_per_producer: self.config.messages_per_producer,
            },
            &self.supervisor,
            &self.registry,
            &self.counters,
            &self.shutdown,
        )
        .await?;

        info!(
            stream = %stream,
            consumers = consumers.len(),
            producers = producers.len(),
            "Harness running"
        );
        Ok(producers)
    }
}
