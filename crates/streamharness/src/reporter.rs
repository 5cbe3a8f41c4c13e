//! Periodic progress logging.

use crate::counters::Counters;
use crate::shutdown::ShutdownHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Logs the counters every `period` until shutdown.
pub struct ProgressReporter {
    counters: Arc<Counters>,
    period: Duration,
    started: Instant,
}

impl ProgressReporter {
    /// Create a reporter; the first line is logged one period from now.
    pub fn new(counters: Arc<Counters>, period: Duration) -> Self {
        Self {
            counters,
            period,
            started: Instant::now(),
        }
    }

    /// Log one progress line.
    pub fn report(&self) {
        let snapshot = self.counters.snapshot();
        info!(
            sent = snapshot.sent,
            consumed = snapshot.consumed,
            published = snapshot.published,
            failed = snapshot.failed,
            elapsed_secs = self.started.elapsed().as_secs(),
            "Progress"
        );
    }

    /// Run until `shutdown` fires and return how many lines were logged.
    pub async fn run(self, mut shutdown: ShutdownHandle) -> u64 {
        let mut ticks = interval_at(self.started + self.period, self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reports = 0;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticks.tick() => {
                    self.report();
                    reports += 1;
                }
            }
        }
        reports
    }

    /// Spawn [`ProgressReporter::run`] on the runtime.
    pub fn spawn(self, shutdown: ShutdownHandle) -> JoinHandle<u64> {
        tokio::spawn(self.run(shutdown))
    }
}
