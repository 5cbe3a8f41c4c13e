//! End-to-end harness scenarios against the in-process broker.
//!
//! Each test runs the full lifecycle:
//! 1. Connect (with retry) and provision the stream
//! 2. Attach consumers, start producers
//! 3. Stop on a trigger or when producers reach their limit
//! 4. Drain and release every handle

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streamharness::{
    Counters, DrainOutcome, Harness, HarnessConfig, HarnessError, ShutdownPhase, ShutdownSignal,
};
use streamharness_client::{
    ClientError, ConnectionSettings, DeliveryMode, HandleKind, MemoryBroker, MemoryConnection,
    RetryPolicy, StreamClient,
};
use tokio::time::Instant;

/// Config sized for tests: fast sends, short drain, quick retries.
fn test_config(stream: &str) -> HarnessConfig {
    HarnessConfig {
        stream_name: stream.to_string(),
        send_interval: Duration::from_millis(5),
        report_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(2),
        drain_poll_interval: Duration::from_millis(10),
        retry: RetryPolicy::fixed(3, Duration::from_millis(10)),
        ..HarnessConfig::default()
    }
}

fn bounded_config(stream: &str, per_producer: u64) -> HarnessConfig {
    HarnessConfig {
        messages_per_producer: Some(per_producer),
        ..test_config(stream)
    }
}

/// Lets the first `allowed` connects through, then refuses credentials or,
/// with `hang` set, never answers.
struct LimitedClient {
    inner: MemoryBroker,
    allowed: usize,
    hang: bool,
    calls: AtomicUsize,
}

impl LimitedClient {
    fn refusing(inner: MemoryBroker, allowed: usize) -> Self {
        Self {
            inner,
            allowed,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn hanging(inner: MemoryBroker, allowed: usize) -> Self {
        Self {
            hang: true,
            ..Self::refusing(inner, allowed)
        }
    }
}

#[async_trait]
impl StreamClient for LimitedClient {
    type Connection = MemoryConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<MemoryConnection, ClientError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            if self.hang {
                return std::future::pending().await;
            }
            return Err(ClientError::Authentication(settings.username.clone()));
        }
        self.inner.connect(settings).await
    }
}

/// Assert nothing keeps publishing or counting once the harness returned.
async fn assert_counters_settled(counters: &Counters, broker: &MemoryBroker, stream: &str) {
    let snapshot = counters.snapshot();
    let len = broker.stream_len(stream).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.snapshot(), snapshot);
    assert_eq!(broker.stream_len(stream).await, len);
}

#[tokio::test]
async fn test_two_producers_five_consumers_forty_messages() {
    let broker = MemoryBroker::default();
    let harness = Harness::new(broker.clone(), bounded_config("test-stream", 20));
    let counters = harness.counters();

    let report = harness
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.signal, ShutdownSignal::ProducersFinished);
    assert_eq!(report.outcome, DrainOutcome::Converged);
    assert_eq!(report.snapshot.sent, 40);
    assert_eq!(report.snapshot.consumed, 40);
    assert_eq!(report.snapshot.failed, 0);
    assert_eq!(report.cleanup_failures, 0);

    assert_eq!(counters.sent(), broker.confirmed_sends());
    assert_eq!(broker.stream_len("test-stream").await, 40);

    // each producer published ids 0..20
    let contents = broker.stream_contents("test-stream").await;
    for id in 0..20u64 {
        let payload = id.to_string();
        let copies = contents.iter().filter(|b| b.as_ref() == payload.as_bytes()).count();
        assert_eq!(copies, 2, "id {id}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_connects_on_fourth_attempt() {
    let broker = MemoryBroker::default();
    broker.fail_next_connects(3);

    let config = HarnessConfig {
        retry: RetryPolicy::default(),
        ..bounded_config("orders", 3)
    };
    let start = Instant::now();
    let report = Harness::new(broker.clone(), config)
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(15));
    assert_eq!(report.snapshot.sent, 6);
    // 4 attempts for provisioning, then one per consumer and producer
    assert_eq!(broker.connect_attempts(), 4 + 5 + 2);
    assert_eq!(broker.connections_opened(), 1 + 5 + 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_is_fatal_after_max_attempts() {
    let broker = MemoryBroker::default();
    broker.fail_next_connects(usize::MAX);

    let config = HarnessConfig {
        retry: RetryPolicy::default(),
        ..test_config("orders")
    };
    let start = Instant::now();
    let err = Harness::new(broker.clone(), config)
        .run_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Connection { attempts: 10, .. }));
    assert_eq!(broker.connect_attempts(), 10);
    assert_eq!(start.elapsed(), Duration::from_secs(45));
    assert!(!broker.has_stream("orders").await);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_consumers_time_out_the_drain() {
    let broker = MemoryBroker::default();
    broker.pause_delivery(true);

    let config = HarnessConfig {
        drain_timeout: Duration::from_secs(1),
        ..bounded_config("stalled", 10)
    };
    let harness = Harness::new(broker.clone(), config);
    let phases = harness.phases();

    let report = harness.run_until(std::future::pending()).await.unwrap();

    assert_eq!(report.outcome, DrainOutcome::TimedOut);
    assert_eq!(report.snapshot.sent, 20);
    assert_eq!(report.snapshot.consumed, 0);
    assert_eq!(report.snapshot.in_flight(), 20);
    assert!(report.elapsed >= Duration::from_secs(1));
    assert!(report.elapsed < Duration::from_secs(2));
    assert_eq!(*phases.borrow(), ShutdownPhase::Done);
    // handles are still released after a timed-out drain
    assert_eq!(broker.close_log().len(), 1 + 2 + 5 + 7);
}

#[tokio::test]
async fn test_provisioning_an_existing_stream() {
    let broker = MemoryBroker::default();

    for _ in 0..2 {
        let report = Harness::new(broker.clone(), bounded_config("shared-stream", 2))
            .run_until(std::future::pending())
            .await
            .unwrap();
        assert_eq!(report.outcome, DrainOutcome::Converged);
    }

    assert_eq!(broker.stream_len("shared-stream").await, 8);
}

#[tokio::test]
async fn test_manual_shutdown_of_unbounded_producers() {
    let broker = MemoryBroker::default();
    let harness = Harness::new(broker.clone(), test_config("manual"));
    let handle = harness.shutdown_handle();
    let counters = harness.counters();

    let stop = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
    });

    let report = harness.run_until(std::future::pending()).await.unwrap();
    stop.await.unwrap();

    assert_eq!(report.signal, ShutdownSignal::Manual);
    assert_eq!(report.outcome, DrainOutcome::Converged);
    assert!(report.snapshot.sent > 0);
    assert_eq!(counters.sent(), broker.confirmed_sends());

    // no sends after shutdown
    let len = broker.stream_len("manual").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.stream_len("manual").await, len);
}

#[tokio::test]
async fn test_trigger_future_stops_the_harness() {
    let broker = MemoryBroker::default();
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        ShutdownSignal::SigTerm
    };

    let report = Harness::new(broker.clone(), test_config("signalled"))
        .run_until(trigger)
        .await
        .unwrap();

    assert_eq!(report.signal, ShutdownSignal::SigTerm);
    assert_eq!(report.snapshot.sent, broker.confirmed_sends());
}

#[tokio::test]
async fn test_unconfirmed_messages_are_not_counted_as_sent() {
    let broker = MemoryBroker::default();
    broker.drop_confirmations(true);

    let report = Harness::new(broker.clone(), bounded_config("unconfirmed", 5))
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.snapshot.sent, 0);
    assert_eq!(report.snapshot.published, 10);
    assert_eq!(report.snapshot.failed, 10);
    assert_eq!(broker.confirmed_sends(), 0);
    // nothing confirmed, so nothing to wait for
    assert_eq!(report.outcome, DrainOutcome::Converged);
}

#[tokio::test]
async fn test_teardown_order_and_close_failures() {
    let broker = MemoryBroker::default();
    broker.fail_closes(true);

    let report = Harness::new(broker.clone(), bounded_config("teardown", 2))
        .run_until(std::future::pending())
        .await
        .unwrap();

    // provisioning close failure is only logged
    assert_eq!(report.cleanup_failures, 2 + 5 + 7);

    let log = broker.close_log();
    let kinds: Vec<HandleKind> = log.iter().map(|(kind, _)| *kind).collect();
    let mut expected = vec![HandleKind::Connection];
    expected.extend([HandleKind::Producer; 2]);
    expected.extend([HandleKind::Consumer; 5]);
    expected.extend([HandleKind::Connection; 7]);
    assert_eq!(kinds, expected);
}

#[tokio::test]
async fn test_startup_failure_releases_created_handles() {
    let broker = MemoryBroker::default();
    // provisioning + three consumers
    let client = LimitedClient::refusing(broker.clone(), 4);

    let err = Harness::new(client, test_config("partial"))
        .run_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Connection {
            attempts: 1,
            source: ClientError::Authentication(_),
            ..
        }
    ));

    let log = broker.close_log();
    let consumers: Vec<&str> = log
        .iter()
        .filter(|(kind, _)| *kind == HandleKind::Consumer)
        .map(|(_, name)| name.as_str())
        .collect();
    assert_eq!(consumers, vec!["consumer-0", "consumer-1", "consumer-2"]);
    assert_eq!(
        log.iter().filter(|(kind, _)| *kind == HandleKind::Connection).count(),
        4
    );
}

#[tokio::test]
async fn test_producer_startup_failure_stops_started_producers() {
    let broker = MemoryBroker::default();
    // provisioning + five consumers + producer-0
    let client = LimitedClient::refusing(broker.clone(), 7);

    let harness = Harness::new(client, test_config("half-started"));
    let counters = harness.counters();
    let handle = harness.shutdown_handle();

    let err = harness.run_until(std::future::pending()).await.unwrap_err();
    assert!(matches!(err, HarnessError::Connection { attempts: 1, .. }));
    assert!(handle.is_shutdown());

    let log = broker.close_log();
    let producers: Vec<&str> = log
        .iter()
        .filter(|(kind, _)| *kind == HandleKind::Producer)
        .map(|(_, name)| name.as_str())
        .collect();
    assert_eq!(producers, vec!["producer-0"]);

    assert_counters_settled(&counters, &broker, "half-started").await;
}

#[tokio::test]
async fn test_trigger_while_producers_are_starting() {
    let broker = MemoryBroker::default();
    // producer-1 never gets its connection
    let client = LimitedClient::hanging(broker.clone(), 7);
    let trigger = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ShutdownSignal::SigTerm
    };

    let harness = Harness::new(client, test_config("interrupted"));
    let counters = harness.counters();
    let report = harness.run_until(trigger).await.unwrap();

    assert_eq!(report.signal, ShutdownSignal::SigTerm);
    // producer-0 was already publishing
    assert!(counters.snapshot().published > 0);
    assert!(broker
        .close_log()
        .iter()
        .any(|(kind, name)| *kind == HandleKind::Producer && name == "producer-0"));

    assert_counters_settled(&counters, &broker, "interrupted").await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_connection_retry() {
    let broker = MemoryBroker::default();
    broker.fail_next_connects(usize::MAX);

    let config = HarnessConfig {
        retry: RetryPolicy::default(),
        ..test_config("never")
    };
    let trigger = async {
        tokio::time::sleep(Duration::from_secs(7)).await;
        ShutdownSignal::SigInt
    };

    let start = Instant::now();
    let report = Harness::new(broker.clone(), config)
        .run_until(trigger)
        .await
        .unwrap();

    assert_eq!(report.signal, ShutdownSignal::SigInt);
    assert_eq!(report.cleanup_failures, 0);
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(broker.connect_attempts(), 2);
}

#[tokio::test]
async fn test_broadcast_consumers_each_see_every_message() {
    let broker = MemoryBroker::new(DeliveryMode::Broadcast);
    let config = HarnessConfig {
        producers: 1,
        consumers: 3,
        ..bounded_config("fanout", 4)
    };

    let report = Harness::new(broker, config)
        .run_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.snapshot.sent, 4);
    assert_eq!(report.outcome, DrainOutcome::Converged);
    // drain only needs consumed >= sent; the rest arrives before release
    assert!(report.snapshot.consumed >= 4);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_connecting() {
    let broker = MemoryBroker::default();
    let config = HarnessConfig {
        report_interval: Duration::ZERO,
        ..test_config("invalid")
    };

    let err = Harness::new(broker.clone(), config)
        .run_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Config(_)));
    assert_eq!(broker.connect_attempts(), 0);
}
