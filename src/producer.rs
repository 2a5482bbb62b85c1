//! Outbound producer caching
//!
//! One producer per destination, created lazily through an external factory
//! and cached for the process lifetime. The registry is owned by the
//! supervisor and passed to consumers — producer lifetime is tied to the
//! supervisor, never to ambient global state.

use crate::error::Result;
use crate::event::ChangeEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Event-bus producer, specified at its client-library boundary.
///
/// `send` returns once the bus acknowledges the event — the synchronous
/// backpressure point of the whole pipeline.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn send(&self, event: &ChangeEvent) -> Result<()>;
}

/// Shared producer handle.
pub type SharedProducer = Arc<dyn EventProducer>;

/// Everything the bus client needs to build one producer.
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    /// Stable stream name: `prefix + destination`
    pub stream_name: String,
    /// The destination this producer serves
    pub destination: String,
    /// Maximum stream length; the bus evicts oldest entries past it
    pub max_stream_len: usize,
    /// Owning-service identity tag attached to the stream
    pub service_id: String,
}

/// Creates producers on first use of a destination.
pub trait ProducerFactory: Send + Sync {
    fn create(&self, spec: &ProducerSpec) -> Result<SharedProducer>;
}

/// Registry-wide producer settings.
#[derive(Debug, Clone)]
pub struct ProducerRegistryConfig {
    /// Prefix prepended to every destination to form the stream name
    pub stream_prefix: String,
    /// Bound applied to every created stream
    pub max_stream_len: usize,
    /// Identity tag for all streams owned by this service
    pub service_id: String,
}

impl Default for ProducerRegistryConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "cdc.".to_string(),
            max_stream_len: 10_000,
            service_id: "logrelay".to_string(),
        }
    }
}

/// Caches one producer per destination with compute-if-absent semantics.
pub struct ProducerRegistry {
    factory: Arc<dyn ProducerFactory>,
    config: ProducerRegistryConfig,
    cache: Mutex<HashMap<String, SharedProducer>>,
}

impl ProducerRegistry {
    pub fn new(factory: Arc<dyn ProducerFactory>, config: ProducerRegistryConfig) -> Self {
        Self {
            factory,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the producer for a destination, creating it on first use.
    ///
    /// Creation happens under the cache lock, so concurrent first-time calls
    /// for one destination always observe the same instance — duplicate
    /// producers are never created.
    pub async fn get(&self, destination: &str) -> Result<SharedProducer> {
        let mut cache = self.cache.lock().await;

        if let Some(producer) = cache.get(destination) {
            return Ok(producer.clone());
        }

        let spec = ProducerSpec {
            stream_name: format!("{}{}", self.config.stream_prefix, destination),
            destination: destination.to_string(),
            max_stream_len: self.config.max_stream_len,
            service_id: self.config.service_id.clone(),
        };
        debug!("Creating producer for stream '{}'", spec.stream_name);

        let producer = self.factory.create(&spec)?;
        cache.insert(destination.to_string(), producer.clone());
        Ok(producer)
    }

    /// Number of cached producers.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Whether any producer has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }
}
