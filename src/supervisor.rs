//! Pipeline supervisor
//!
//! Builds one consumer and one controller per configured collection and runs
//! them concurrently on the shared runtime. A collection whose configuration
//! is invalid is logged and skipped at construction time — the others start
//! unaffected. The supervisor owns the producer registry and the shutdown
//! channel, and holds no per-collection state beyond the running pipelines.

use crate::config::ConnectorConfig;
use crate::consumer::{ConsumerFactory, FeatureGate, StaticGate};
use crate::controller::{Controller, ControllerConfig};
use crate::engine::{EngineContext, EngineFactory};
use crate::lock::{LockConfig, LockCoordinator, SharedLockManager};
use crate::metrics::PipelineMetrics;
use crate::offset::{OffsetStore, SharedOffsetBackend};
use crate::producer::{ProducerFactory, ProducerRegistry, ProducerRegistryConfig};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct Pipeline {
    controller: Arc<Controller>,
    task: JoinHandle<()>,
}

/// Start/stop entry point for one connector's set of pipelines.
pub struct Supervisor {
    config: Arc<ConnectorConfig>,
    engine_factory: Arc<dyn EngineFactory>,
    producer_factory: Arc<dyn ProducerFactory>,
    lock_manager: SharedLockManager,
    offset_backend: SharedOffsetBackend,
    gate: Arc<dyn FeatureGate>,
    registry_config: ProducerRegistryConfig,
    lock_config: LockConfig,
    controller_config: ControllerConfig,
    metrics: Arc<PipelineMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    pipelines: Vec<Pipeline>,
}

impl Supervisor {
    pub fn new(
        config: ConnectorConfig,
        engine_factory: Arc<dyn EngineFactory>,
        producer_factory: Arc<dyn ProducerFactory>,
        lock_manager: SharedLockManager,
        offset_backend: SharedOffsetBackend,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            config: Arc::new(config),
            engine_factory,
            producer_factory,
            lock_manager,
            offset_backend,
            gate: Arc::new(StaticGate(true)),
            registry_config: ProducerRegistryConfig::default(),
            lock_config: LockConfig::default(),
            controller_config: ControllerConfig::default(),
            metrics: Arc::new(PipelineMetrics::new()),
            shutdown_tx,
            pipelines: Vec::new(),
        }
    }

    /// Set the live feature toggle consulted by snapshot consumers.
    pub fn with_feature_gate(mut self, gate: Arc<dyn FeatureGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Override registry-wide producer settings.
    pub fn with_registry_config(mut self, config: ProducerRegistryConfig) -> Self {
        self.registry_config = config;
        self
    }

    /// Override lease timings.
    pub fn with_lock_config(mut self, config: LockConfig) -> Self {
        self.lock_config = config;
        self
    }

    /// Override controller timings and recovery behavior.
    pub fn with_controller_config(mut self, config: ControllerConfig) -> Self {
        self.controller_config = config;
        self
    }

    /// Shared pipeline counters.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Controllers of the running pipelines.
    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.pipelines.iter().map(|p| p.controller.clone()).collect()
    }

    /// Start one pipeline per valid configured collection.
    ///
    /// Returns the number of pipelines started. Invalid collections are
    /// fatal only for themselves: logged and skipped.
    pub fn start(&mut self) -> usize {
        let registry = Arc::new(ProducerRegistry::new(
            self.producer_factory.clone(),
            self.registry_config.clone(),
        ));
        let coordinator = Arc::new(LockCoordinator::new(
            self.lock_manager.clone(),
            self.lock_config.clone(),
        ));
        let consumer_factory =
            ConsumerFactory::new(registry, self.gate.clone(), self.metrics.clone());

        for spec in &self.config.collections {
            if let Err(e) = self.config.validate_collection(spec) {
                error!("Skipping collection '{}': {}", spec.collection, e);
                continue;
            }

            let consumer = consumer_factory.build(spec.consumer, &self.config);
            let name = self.config.stable_name(&spec.collection);
            let offsets = Arc::new(OffsetStore::new(self.offset_backend.clone(), name.clone()));
            let ctx = EngineContext {
                config: self.config.clone(),
                collection: spec.collection.clone(),
                consumer,
                offsets,
            };
            let controller = Arc::new(Controller::new(
                name,
                coordinator.clone(),
                self.engine_factory.clone(),
                ctx,
                self.controller_config.clone(),
                self.metrics.clone(),
            ));

            let rx = self.shutdown_tx.subscribe();
            let task = tokio::spawn({
                let controller = controller.clone();
                async move { controller.run(rx).await }
            });
            info!(
                "Started pipeline for collection '{}' ({:?} consumer)",
                spec.collection, spec.consumer
            );
            self.pipelines.push(Pipeline { controller, task });
        }

        self.pipelines.len()
    }

    /// Signal every controller to stop and wait for all of them.
    pub async fn shutdown(&mut self) {
        info!("Supervisor stopping {} pipelines", self.pipelines.len());
        let _ = self.shutdown_tx.send(());

        for pipeline in self.pipelines.drain(..) {
            if let Err(e) = pipeline.task.await {
                warn!(
                    "Controller '{}' task ended abnormally: {}",
                    pipeline.controller.name(),
                    e
                );
            }
        }
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerKind;
    use crate::controller::RunState;
    use crate::engine::{SharedEngine, TailEngine};
    use crate::error::Result;
    use crate::event::ChangeEvent;
    use crate::lock::InMemoryLockManager;
    use crate::offset::MemoryOffsetBackend;
    use crate::producer::{EventProducer, ProducerSpec, SharedProducer};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    struct BlockingEngine {
        closed: Notify,
    }

    #[async_trait]
    impl TailEngine for BlockingEngine {
        async fn run(&self) -> Result<()> {
            self.closed.notified().await;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.notify_waiters();
            Ok(())
        }
    }

    struct BlockingEngineFactory;

    #[async_trait]
    impl EngineFactory for BlockingEngineFactory {
        async fn build(&self, _ctx: &EngineContext) -> Result<SharedEngine> {
            Ok(Arc::new(BlockingEngine {
                closed: Notify::new(),
            }))
        }
    }

    struct NoopProducer;

    #[async_trait]
    impl EventProducer for NoopProducer {
        async fn send(&self, _event: &ChangeEvent) -> Result<()> {
            Ok(())
        }
    }

    struct NoopProducerFactory;

    impl ProducerFactory for NoopProducerFactory {
        fn create(&self, _spec: &ProducerSpec) -> Result<SharedProducer> {
            Ok(Arc::new(NoopProducer))
        }
    }

    fn fast_supervisor(config: ConnectorConfig) -> Supervisor {
        Supervisor::new(
            config,
            Arc::new(BlockingEngineFactory),
            Arc::new(NoopProducerFactory),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(MemoryOffsetBackend::new()),
        )
        .with_lock_config(LockConfig {
            lease_ttl: Duration::from_millis(200),
            retry_delay: Duration::from_millis(20),
            refresh_interval: Duration::from_millis(50),
        })
        .with_controller_config(
            ControllerConfig::builder()
                .poll_interval(Duration::from_millis(20))
                .stop_grace(Duration::from_millis(100))
                .restart_backoff(Duration::from_millis(20))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_starts_one_pipeline_per_collection() {
        let config = ConnectorConfig::builder()
            .connector_name("conn")
            .database("db")
            .collection("orders", ConsumerKind::Streaming)
            .collection("users", ConsumerKind::Streaming)
            .build()
            .unwrap();
        let mut supervisor = fast_supervisor(config);

        assert_eq!(supervisor.start(), 2);
        let controllers = supervisor.controllers();
        sleep(Duration::from_millis(100)).await;
        for controller in &controllers {
            assert_eq!(controller.state().await, RunState::Running);
        }

        supervisor.shutdown().await;
        for controller in &controllers {
            assert_eq!(controller.state().await, RunState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_invalid_collection_skipped_others_start() {
        let config = ConnectorConfig::builder()
            .connector_name("conn")
            .database("db")
            .collection("orders", ConsumerKind::Streaming)
            .collection("", ConsumerKind::Streaming)
            .collection("audit_log", ConsumerKind::Streaming)
            .exclude_collection("audit_log")
            .build()
            .unwrap();
        let mut supervisor = fast_supervisor(config);

        assert_eq!(supervisor.start(), 1);
        assert_eq!(supervisor.controllers()[0].name(), "conn-orders");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_no_pipelines_is_clean() {
        let config = ConnectorConfig::builder()
            .connector_name("conn")
            .database("db")
            .build()
            .unwrap();
        let mut supervisor = fast_supervisor(config);

        assert_eq!(supervisor.start(), 0);
        supervisor.shutdown().await;
    }
}
