//! # logrelay - leased, crash-recoverable CDC pipelines
//!
//! A change-data-capture control plane: per monitored collection it runs a
//! leased pipeline that tails a source database's replication log (through an
//! external engine) and republishes each change on an event bus, with durable
//! offset checkpointing. Delivery is at-least-once; downstream consumers are
//! expected to be idempotent.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//!    │  one per configured collection
//!    ▼
//! Controller ──► LockCoordinator (lease + background refresh)
//!    │
//!    ▼
//! TailEngine (external) ──► ChangeConsumer ──► ProducerRegistry ──► event bus
//!    │                           │
//!    ▼                           ▼
//! OffsetStore ◄── batch finished / offsets flushed
//! ```
//!
//! The external collaborators — the log-tailing engine, the event-bus client
//! and the distributed lock manager — enter through the [`TailEngine`],
//! [`EventProducer`] and [`LockManager`] traits. Everything else is this
//! crate's responsibility: mutual exclusion per collection, in-order
//! publication, abort-on-failure batch commits, and offset recovery across
//! restarts.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example(
//! #     engine_factory: std::sync::Arc<dyn logrelay::EngineFactory>,
//! #     producer_factory: std::sync::Arc<dyn logrelay::ProducerFactory>,
//! # ) {
//! use logrelay::{
//!     ConnectorConfig, ConsumerKind, FileOffsetBackend, InMemoryLockManager, Supervisor,
//! };
//! use std::sync::Arc;
//!
//! let config = ConnectorConfig::builder()
//!     .connector_name("shop-connector")
//!     .database("shopdb")
//!     .collection("orders", ConsumerKind::Streaming)
//!     .collection("users", ConsumerKind::Streaming)
//!     .build()
//!     .unwrap();
//!
//! let mut supervisor = Supervisor::new(
//!     config,
//!     engine_factory,
//!     producer_factory,
//!     Arc::new(InMemoryLockManager::new()),
//!     Arc::new(FileOffsetBackend::new("/var/lib/logrelay/offsets")),
//! );
//! supervisor.start();
//! // ... run until termination ...
//! supervisor.shutdown().await;
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod controller;
pub mod engine;
pub mod error;
pub mod event;
pub mod lock;
pub mod metrics;
pub mod offset;
pub mod producer;
pub mod supervisor;

// Core types
pub use config::{CollectionSpec, ConnectorConfig, ConnectorConfigBuilder, ConsumerKind, SnapshotMode};
pub use error::{RelayError, Result};
pub use event::{ChangeEvent, OpType, SourceRecord, DEFAULT_SENTINEL, OP_HEADER};
pub use supervisor::Supervisor;

// Collaborator seams
pub use consumer::{BatchCommitter, ChangeConsumer, FeatureGate, StaticGate};
pub use engine::{EngineContext, EngineFactory, SharedEngine, TailEngine};
pub use lock::{InMemoryLockManager, LockManager, SharedLockManager};
pub use producer::{EventProducer, ProducerFactory, ProducerSpec, SharedProducer};

// Pipeline building blocks
pub use consumer::{ConsumerFactory, SnapshotChangeConsumer, StreamingChangeConsumer};
pub use controller::{Controller, ControllerConfig, ControllerConfigBuilder, RunState};
pub use lock::{LeaseHandle, LockConfig, LockCoordinator};
pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use offset::{
    FileOffsetBackend, MemoryOffsetBackend, OffsetBackend, OffsetStore, SharedOffsetBackend,
};
pub use producer::{ProducerRegistry, ProducerRegistryConfig};
