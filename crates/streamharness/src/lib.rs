//! StreamHarness - producer/consumer load harness for stream brokers
//!
//! Runs a fixed set of producers and consumers against one stream, counts
//! confirmed sends and deliveries, logs progress periodically and, on
//! shutdown, waits for consumers to catch up before releasing every client
//! handle.
//!
//! ## Architecture
//!
//! - **ConnectionSupervisor**: opens connections with bounded retry
//! - **StreamProvisioner**: creates the target stream if missing
//! - **ConsumerPool / ProducerPool**: one connection per consumer or producer
//! - **ProgressReporter**: periodic counter log line
//! - **ShutdownCoordinator**: RUNNING → DRAINING → CLOSING → DONE
//!
//! The broker is reached only through the
//! [`streamharness_client::StreamClient`] trait, so the whole harness runs
//! against the in-process [`streamharness_client::MemoryBroker`] in tests.
//!
//! # Example
//!
//! ```ignore
//! use streamharness::{Harness, HarnessConfig, shutdown_signal};
//! use streamharness_client::RabbitMqClient;
//!
//! let config = HarnessConfig::from_env()?;
//! let report = Harness::new(RabbitMqClient, config)
//!     .run_until(shutdown_signal())
//!     .await?;
//! println!("{}", report.snapshot);
//! ```

pub mod config;
pub mod consumer_pool;
pub mod coordinator;
pub mod counters;
pub mod error;
pub mod harness;
pub mod producer_pool;
pub mod provisioner;
pub mod registry;
pub mod reporter;
pub mod shutdown;
pub mod supervisor;

pub use config::{HarnessConfig, BROKER_HOST_ENV, BROKER_PORT_ENV};
pub use consumer_pool::ConsumerPool;
pub use coordinator::{DrainOutcome, ShutdownCoordinator, ShutdownPhase, ShutdownReport};
pub use counters::{CounterSnapshot, Counters};
pub use error::{HarnessError, Result};
pub use harness::Harness;
pub use producer_pool::{ProducerPool, ProducerPoolConfig, CONFIRM_CHANNEL_CAPACITY};
pub use provisioner::{ensure_stream, StreamProvisioner};
pub use registry::{HandleRegistry, Registered, RegisteredHandles};
pub use reporter::ProgressReporter;
pub use shutdown::{shutdown_signal, ShutdownHandle, ShutdownSignal};
pub use supervisor::ConnectionSupervisor;
