//! Change consumers
//!
//! A consumer turns the engine's raw batches into canonical envelopes and
//! publishes them, marking progress through the engine's committer. Two
//! variants exist behind the closed [`ConsumerKind`] tag: streaming for
//! continuous log tailing and snapshot for the initial bulk phase.
//!
//! ## Publish-failure policy
//!
//! Both variants abort the batch on a failed publish: no later record is
//! marked processed and the batch is never marked finished, so a controller
//! restart replays from the last committed position. At-least-once, never
//! skipped.

use crate::config::{ConnectorConfig, ConsumerKind};
use crate::error::{RelayError, Result};
use crate::event::{ChangeEvent, OpType, SourceRecord};
use crate::metrics::PipelineMetrics;
use crate::producer::ProducerRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Per-batch progress callback handed in by the log-tailing engine.
///
/// Marking the batch finished is the only trigger that lets the engine
/// persist new offsets.
#[async_trait]
pub trait BatchCommitter: Send {
    /// Mark one record durably processed. Called only after its publish was
    /// acknowledged (or it was deliberately gated off).
    async fn mark_processed(&mut self, record: &SourceRecord) -> Result<()>;

    /// Mark the whole batch finished, allowing offset advancement.
    async fn mark_batch_finished(&mut self) -> Result<()>;
}

/// Batch-delivery callback invoked by the engine's own task.
#[async_trait]
pub trait ChangeConsumer: Send + Sync {
    async fn handle_batch(
        &self,
        records: &[SourceRecord],
        committer: &mut dyn BatchCommitter,
    ) -> Result<()>;
}

/// Live feature toggle consulted per event during the snapshot phase.
///
/// When disabled, snapshot events still advance offsets but are not sent —
/// the dark-launch switch.
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, destination: &str) -> bool;
}

/// Gate pinned to one value; the default when no toggle service is wired in.
pub struct StaticGate(pub bool);

impl FeatureGate for StaticGate {
    fn is_enabled(&self, _destination: &str) -> bool {
        self.0
    }
}

/// Streaming consumer: publish every record in source-log order.
pub struct StreamingChangeConsumer {
    registry: Arc<ProducerRegistry>,
    excluded_fields: Vec<String>,
    metrics: Arc<PipelineMetrics>,
}

impl StreamingChangeConsumer {
    pub fn new(
        registry: Arc<ProducerRegistry>,
        excluded_fields: Vec<String>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            excluded_fields,
            metrics,
        }
    }
}

#[async_trait]
impl ChangeConsumer for StreamingChangeConsumer {
    async fn handle_batch(
        &self,
        records: &[SourceRecord],
        committer: &mut dyn BatchCommitter,
    ) -> Result<()> {
        debug!("Handling streaming batch of {} records", records.len());

        for record in records {
            let event = ChangeEvent::from_record(record, &self.excluded_fields);
            let producer = self.registry.get(event.destination()).await?;

            if let Err(e) = producer.send(&event).await {
                self.metrics.record_publish_failure();
                error!(
                    "Publish failed for destination '{}', aborting batch: {}",
                    event.destination(),
                    e
                );
                return Err(e);
            }

            self.metrics.record_published();
            committer.mark_processed(record).await?;
        }

        committer.mark_batch_finished().await?;
        self.metrics.record_batch_committed();
        Ok(())
    }
}

/// Snapshot consumer: deduplicate the batch down to the last state per key,
/// publish only snapshot-tagged records.
pub struct SnapshotChangeConsumer {
    registry: Arc<ProducerRegistry>,
    excluded_fields: Vec<String>,
    gate: Arc<dyn FeatureGate>,
    metrics: Arc<PipelineMetrics>,
}

impl SnapshotChangeConsumer {
    pub fn new(
        registry: Arc<ProducerRegistry>,
        excluded_fields: Vec<String>,
        gate: Arc<dyn FeatureGate>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            excluded_fields,
            gate,
            metrics,
        }
    }

    /// Reverse the batch and keep the first surviving record per key — the
    /// chronologically last state wins.
    fn dedup<'a>(records: &'a [SourceRecord]) -> Vec<&'a SourceRecord> {
        let mut seen = std::collections::HashSet::new();
        records
            .iter()
            .rev()
            .filter(|r| seen.insert(r.dedup_key().to_string()))
            .collect()
    }
}

#[async_trait]
impl ChangeConsumer for SnapshotChangeConsumer {
    async fn handle_batch(
        &self,
        records: &[SourceRecord],
        committer: &mut dyn BatchCommitter,
    ) -> Result<()> {
        let survivors = Self::dedup(records);
        debug!(
            "Handling snapshot batch: {} records, {} after dedup",
            records.len(),
            survivors.len()
        );

        for record in survivors {
            let op = record.op();
            if op != OpType::Snapshot {
                // The log has moved past the snapshot window; the phase is
                // over. Terminal for this run, handled by the controller.
                return Err(RelayError::SnapshotComplete {
                    destination: record.destination.clone(),
                    op: op.to_string(),
                });
            }

            if !self.gate.is_enabled(&record.destination) {
                self.metrics.record_skipped();
                committer.mark_processed(record).await?;
                continue;
            }

            let event = ChangeEvent::from_record(record, &self.excluded_fields);
            let producer = self.registry.get(event.destination()).await?;

            if let Err(e) = producer.send(&event).await {
                self.metrics.record_publish_failure();
                error!(
                    "Snapshot publish failed for destination '{}', aborting batch: {}",
                    event.destination(),
                    e
                );
                return Err(e);
            }

            self.metrics.record_published();
            committer.mark_processed(record).await?;
        }

        committer.mark_batch_finished().await?;
        self.metrics.record_batch_committed();
        Ok(())
    }
}

/// Maps the closed [`ConsumerKind`] tag to an implementation.
pub struct ConsumerFactory {
    registry: Arc<ProducerRegistry>,
    gate: Arc<dyn FeatureGate>,
    metrics: Arc<PipelineMetrics>,
}

impl ConsumerFactory {
    pub fn new(
        registry: Arc<ProducerRegistry>,
        gate: Arc<dyn FeatureGate>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            registry,
            gate,
            metrics,
        }
    }

    /// Build the consumer for one collection.
    pub fn build(&self, kind: ConsumerKind, config: &ConnectorConfig) -> Arc<dyn ChangeConsumer> {
        match kind {
            ConsumerKind::Streaming => Arc::new(StreamingChangeConsumer::new(
                self.registry.clone(),
                config.excluded_fields.clone(),
                self.metrics.clone(),
            )),
            ConsumerKind::Snapshot => Arc::new(SnapshotChangeConsumer::new(
                self.registry.clone(),
                config.excluded_fields.clone(),
                self.gate.clone(),
                self.metrics.clone(),
            )),
        }
    }
}
