//! Log-tailing engine boundary
//!
//! The engine that actually reads the source database's replication log is
//! an external collaborator. The core hands it a consumer and an offset
//! store, runs it as a cancellable task, and closes it within a bounded
//! grace period. One engine instance serves one `Running` phase — the
//! controller builds a fresh one per cycle through [`EngineFactory`].

use crate::config::ConnectorConfig;
use crate::consumer::ChangeConsumer;
use crate::error::Result;
use crate::offset::OffsetStore;
use async_trait::async_trait;
use std::sync::Arc;

/// External log-tailing engine.
///
/// `run` reads offsets at startup, tails the log and pushes batches into the
/// consumer from its own task; it returns when the engine stops on its own
/// or fails. `close` is the bounded shutdown path — it must flush any final
/// in-memory offset state before returning.
#[async_trait]
pub trait TailEngine: Send + Sync {
    async fn run(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Shared engine handle.
pub type SharedEngine = Arc<dyn TailEngine>;

/// Everything an engine needs for one collection's pipeline.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<ConnectorConfig>,
    pub collection: String,
    pub consumer: Arc<dyn ChangeConsumer>,
    pub offsets: Arc<OffsetStore>,
}

/// Builds one engine per controller `Running` cycle.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(&self, ctx: &EngineContext) -> Result<SharedEngine>;
}
