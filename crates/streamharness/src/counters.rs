//! Shared progress counters.
//!
//! All fields only ever grow. Producers, confirmation tasks and consumer
//! delivery callbacks increment them concurrently; the reporter and the
//! shutdown coordinator read them. Reads are not synchronized with each
//! other, so a snapshot is approximate while traffic is flowing.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Message counters shared by every producer and consumer.
#[derive(Debug, Default)]
pub struct Counters {
    /// Messages confirmed by the broker
    sent: AtomicU64,
    /// Messages delivered to consumer handlers
    consumed: AtomicU64,
    /// Messages accepted by the client, confirmed or not
    published: AtomicU64,
    /// Rejected submits and negative or missing confirmations
    failed: AtomicU64,
}

impl Counters {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one confirmed send; returns the new total.
    pub fn record_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one delivered message; returns the new total.
    pub fn record_consumed(&self) -> u64 {
        self.consumed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one message accepted by the client.
    pub fn record_published(&self) -> u64 {
        self.published.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count one message that will never be confirmed.
    pub fn record_failed(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Confirmed sends so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Delivered messages so far.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`Counters`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Confirmed sends
    pub sent: u64,
    /// Delivered messages
    pub consumed: u64,
    /// Accepted by the client
    pub published: u64,
    /// Never confirmed
    pub failed: u64,
}

impl CounterSnapshot {
    /// Consumers have seen at least as many messages as were confirmed.
    pub fn is_drained(&self) -> bool {
        self.sent <= self.consumed
    }

    /// Confirmed messages not yet consumed.
    pub fn in_flight(&self) -> u64 {
        self.sent.saturating_sub(self.consumed)
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sent: {}, Consumed: {}, Published: {}, Failed: {}",
            self.sent, self.consumed, self.published, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_returns_new_total() {
        let counters = Counters::new();
        assert_eq!(counters.record_sent(), 1);
        assert_eq!(counters.record_sent(), 2);
        assert_eq!(counters.record_consumed(), 1);
        assert_eq!(counters.record_published(), 1);
        assert_eq!(counters.record_failed(), 1);
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                sent: 2,
                consumed: 1,
                published: 1,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_drained_and_in_flight() {
        let snapshot = CounterSnapshot {
            sent: 50,
            consumed: 10,
            ..Default::default()
        };
        assert!(!snapshot.is_drained());
        assert_eq!(snapshot.in_flight(), 40);

        let snapshot = CounterSnapshot {
            sent: 40,
            consumed: 200,
            ..Default::default()
        };
        assert!(snapshot.is_drained());
        assert_eq!(snapshot.in_flight(), 0);
        assert!(CounterSnapshot::default().is_drained());
    }

    #[test]
    fn test_display() {
        let snapshot = CounterSnapshot {
            sent: 40,
            consumed: 38,
            published: 41,
            failed: 1,
        };
        assert_eq!(
            snapshot.to_string(),
            "Sent: 40, Consumed: 38, Published: 41, Failed: 1"
        );
    }

    #[test]
    fn test_concurrent_increments() {
        let counters = Arc::new(Counters::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_sent();
                        counters.record_consumed();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counters.sent(), 8000);
        assert_eq!(counters.consumed(), 8000);
    }
}
