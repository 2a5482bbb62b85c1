//! Connector and collection configuration
//!
//! Settings bags passed to the supervisor. Most engine-facing values are
//! opaque pass-through; the core interprets only batch/poll/grace timings.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Snapshot behavior on cold start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Perform an initial bulk snapshot before streaming
    Initial,
    /// Stream from the current log position only
    Never,
}

/// Closed tag selecting a [`ChangeConsumer`](crate::consumer::ChangeConsumer)
/// implementation for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    /// Continuous log tailing
    Streaming,
    /// Initial bulk snapshot phase
    Snapshot,
}

impl FromStr for ConsumerKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "streaming" => Ok(ConsumerKind::Streaming),
            "snapshot" => Ok(ConsumerKind::Snapshot),
            other => Err(RelayError::config(format!(
                "Unsupported consumer type '{}'. Available: streaming, snapshot",
                other
            ))),
        }
    }
}

/// One monitored collection and the consumer variant serving it.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub collection: String,
    pub consumer: ConsumerKind,
}

impl CollectionSpec {
    pub fn new(collection: impl Into<String>, consumer: ConsumerKind) -> Self {
        Self {
            collection: collection.into(),
            consumer,
        }
    }
}

/// Connector-wide settings.
///
/// Batch and queue bounds pass through to the log-tailing engine; the core
/// reads only the timings it schedules with.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Connector name, part of every stable offset/lease name
    pub connector_name: String,
    /// Monitored source database
    pub database: String,
    /// Collections to monitor
    pub collections: Vec<CollectionSpec>,
    /// Collections explicitly excluded from monitoring
    pub excluded_collections: Vec<String>,
    /// Fields scrubbed from published values
    pub excluded_fields: Vec<String>,
    /// Maximum events per engine batch
    pub max_batch_size: usize,
    /// Maximum queued events inside the engine
    pub max_queue_size: usize,
    /// Maximum queued bytes inside the engine
    pub max_queue_size_bytes: usize,
    /// Engine poll interval
    pub poll_interval: Duration,
    /// Engine heartbeat interval
    pub heartbeat_interval: Duration,
    /// Snapshot behavior on cold start
    pub snapshot_mode: SnapshotMode,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_name: String::new(),
            database: String::new(),
            collections: Vec::new(),
            excluded_collections: Vec::new(),
            excluded_fields: Vec::new(),
            max_batch_size: 1000,
            max_queue_size: 8192,
            max_queue_size_bytes: 1_048_576,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            snapshot_mode: SnapshotMode::Initial,
        }
    }
}

impl ConnectorConfig {
    /// Create a builder.
    pub fn builder() -> ConnectorConfigBuilder {
        ConnectorConfigBuilder::default()
    }

    /// Validate connector-wide settings.
    pub fn validate(&self) -> Result<()> {
        if self.connector_name.is_empty() {
            return Err(RelayError::config("connector name must not be empty"));
        }
        if self.database.is_empty() {
            return Err(RelayError::config("database must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(RelayError::config("max batch size must be positive"));
        }
        Ok(())
    }

    /// Validate one collection against connector-wide settings.
    ///
    /// Errors here are fatal for that collection only.
    pub fn validate_collection(&self, spec: &CollectionSpec) -> Result<()> {
        if spec.collection.is_empty() {
            return Err(RelayError::config("collection name must not be empty"));
        }
        if self
            .excluded_collections
            .iter()
            .any(|c| c == &spec.collection)
        {
            return Err(RelayError::config(format!(
                "collection '{}' is excluded from monitoring",
                spec.collection
            )));
        }
        if spec.consumer == ConsumerKind::Snapshot && self.snapshot_mode == SnapshotMode::Never {
            return Err(RelayError::config(format!(
                "collection '{}' requests a snapshot consumer but snapshot mode is 'never'",
                spec.collection
            )));
        }
        Ok(())
    }

    /// Stable per-collection name shared by the offset record and the lease.
    pub fn stable_name(&self, collection: &str) -> String {
        format!("{}-{}", self.connector_name, collection)
    }
}

/// Builder for [`ConnectorConfig`].
#[derive(Debug, Default)]
pub struct ConnectorConfigBuilder {
    config: ConnectorConfig,
}

impl ConnectorConfigBuilder {
    pub fn connector_name(mut self, name: impl Into<String>) -> Self {
        self.config.connector_name = name.into();
        self
    }

    pub fn database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    pub fn collection(mut self, name: impl Into<String>, consumer: ConsumerKind) -> Self {
        self.config.collections.push(CollectionSpec::new(name, consumer));
        self
    }

    pub fn exclude_collection(mut self, name: impl Into<String>) -> Self {
        self.config.excluded_collections.push(name.into());
        self
    }

    pub fn excluded_fields(mut self, fields: Vec<String>) -> Self {
        self.config.excluded_fields = fields;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.config.max_batch_size = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.config.max_queue_size = n;
        self
    }

    pub fn max_queue_size_bytes(mut self, n: usize) -> Self {
        self.config.max_queue_size_bytes = n;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.config.heartbeat_interval = d;
        self
    }

    pub fn snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.config.snapshot_mode = mode;
        self
    }

    pub fn build(self) -> Result<ConnectorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
