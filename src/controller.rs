//! Per-collection pipeline controller
//!
//! One controller supervises one collection's pipeline as a state machine:
//!
//! ```text
//! AcquiringLock ──► Running ──► Stopping ──► (loop)
//!       │                                       │
//!       └──────────── shutdown ────────────► Stopped
//! ```
//!
//! Nothing that happens while running is fatal to the hosting process: engine
//! failures and lease losses both funnel through `Stopping` back into
//! `AcquiringLock`. Only an explicit shutdown signal is terminal.

use crate::engine::{EngineContext, EngineFactory};
use crate::lock::{LeaseHandle, LockCoordinator};
use crate::metrics::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    AcquiringLock,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::AcquiringLock => write!(f, "acquiring-lock"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Timing and recovery knobs for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often the running engine task and lease are checked
    pub poll_interval: Duration,
    /// Hard bound on engine close during `Stopping`
    pub stop_grace: Duration,
    /// Delay before re-entering `AcquiringLock` after a cycle ends
    pub restart_backoff: Duration,
    /// Clear persisted offsets when the engine fails, forcing a full resync
    pub reset_offsets_on_failure: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            restart_backoff: Duration::from_secs(10),
            reset_offsets_on_failure: true,
        }
    }
}

impl ControllerConfig {
    pub fn builder() -> ControllerConfigBuilder {
        ControllerConfigBuilder::default()
    }
}

/// Builder for [`ControllerConfig`].
#[derive(Debug, Default)]
pub struct ControllerConfigBuilder {
    poll_interval: Option<Duration>,
    stop_grace: Option<Duration>,
    restart_backoff: Option<Duration>,
    reset_offsets_on_failure: Option<bool>,
}

impl ControllerConfigBuilder {
    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = Some(d);
        self
    }

    pub fn stop_grace(mut self, d: Duration) -> Self {
        self.stop_grace = Some(d);
        self
    }

    pub fn restart_backoff(mut self, d: Duration) -> Self {
        self.restart_backoff = Some(d);
        self
    }

    pub fn reset_offsets_on_failure(mut self, v: bool) -> Self {
        self.reset_offsets_on_failure = Some(v);
        self
    }

    pub fn build(self) -> ControllerConfig {
        let default = ControllerConfig::default();
        ControllerConfig {
            poll_interval: self.poll_interval.unwrap_or(default.poll_interval),
            stop_grace: self.stop_grace.unwrap_or(default.stop_grace),
            restart_backoff: self.restart_backoff.unwrap_or(default.restart_backoff),
            reset_offsets_on_failure: self
                .reset_offsets_on_failure
                .unwrap_or(default.reset_offsets_on_failure),
        }
    }
}

/// Supervises one collection's leased pipeline.
pub struct Controller {
    name: String,
    coordinator: Arc<LockCoordinator>,
    engine_factory: Arc<dyn EngineFactory>,
    ctx: EngineContext,
    config: ControllerConfig,
    metrics: Arc<PipelineMetrics>,
    state: RwLock<RunState>,
}

impl Controller {
    pub fn new(
        name: impl Into<String>,
        coordinator: Arc<LockCoordinator>,
        engine_factory: Arc<dyn EngineFactory>,
        ctx: EngineContext,
        config: ControllerConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            coordinator,
            engine_factory,
            ctx,
            config,
            metrics,
            state: RwLock::new(RunState::AcquiringLock),
        }
    }

    /// Lease and offset-record name this controller owns.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    async fn set_state(&self, next: RunState) {
        *self.state.write().await = next;
    }

    /// Run the state machine until shutdown.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Controller '{}' starting", self.name);

        loop {
            self.set_state(RunState::AcquiringLock).await;
            let Some(lease) = self
                .coordinator
                .acquire_with_refresh(&self.name, &mut shutdown)
                .await
            else {
                // Shutdown arrived while waiting for the lease.
                break;
            };
            self.metrics.record_lease_acquired();

            self.set_state(RunState::Running).await;
            let mut shutdown_seen = self.run_engine(&lease, &mut shutdown).await;

            self.set_state(RunState::Stopping).await;
            lease.release().await;

            shutdown_seen = shutdown_seen || shutdown_signalled(&mut shutdown);
            if shutdown_seen {
                break;
            }

            self.metrics.record_engine_restart();
            info!(
                "Controller '{}' restarting after {:?}",
                self.name, self.config.restart_backoff
            );
            tokio::select! {
                _ = sleep(self.config.restart_backoff) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.set_state(RunState::Stopped).await;
        info!("Controller '{}' stopped", self.name);
    }

    /// One `Running` phase: fresh engine, poll until it finishes, the lease
    /// lapses, or shutdown. Returns true when shutdown was observed.
    async fn run_engine(&self, lease: &LeaseHandle, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let engine = match self.engine_factory.build(&self.ctx).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Engine build failed for '{}': {}", self.name, e);
                return false;
            }
        };

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });
        info!("Engine started for '{}'", self.name);

        let mut shutdown_seen = false;
        loop {
            if task.is_finished() {
                break;
            }
            if !lease.is_held() {
                // An unleased run must never keep publishing.
                warn!("Lease lost for '{}', forcing stop", self.name);
                self.metrics.record_lease_lost();
                break;
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown requested for '{}'", self.name);
                    shutdown_seen = true;
                    break;
                }
            }
        }

        // Bounded close; the grace period is a hard timeout and the cycle
        // proceeds regardless of the close outcome.
        match timeout(self.config.stop_grace, engine.close()).await {
            Ok(Ok(())) => info!("Engine closed for '{}'", self.name),
            Ok(Err(e)) => warn!("Engine close failed for '{}': {}", self.name, e),
            Err(_) => warn!(
                "Engine close for '{}' exceeded {:?} grace",
                self.name, self.config.stop_grace
            ),
        }
        task.abort();

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_snapshot_complete() => {
                // The snapshot window closed; streaming takes over from the
                // committed position. Not a failure.
                info!("Engine for '{}' finished: {}", self.name, e);
            }
            Ok(Err(e)) => {
                error!("Engine for '{}' failed: {}", self.name, e);
                self.compensate_engine_failure().await;
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                error!("Engine task for '{}' panicked: {}", self.name, join_err);
                self.compensate_engine_failure().await;
            }
        }

        shutdown_seen
    }

    /// Engine failure recovery: drop the persisted offsets so the next run
    /// resyncs from scratch instead of resuming a possibly inconsistent
    /// position.
    async fn compensate_engine_failure(&self) {
        if !self.config.reset_offsets_on_failure {
            return;
        }
        match self.ctx.offsets.reset().await {
            Ok(()) => self.metrics.record_offset_reset(),
            Err(e) => error!("Offset reset failed for '{}': {}", self.name, e),
        }
    }
}

/// Drain the shutdown channel without blocking.
fn shutdown_signalled(rx: &mut broadcast::Receiver<()>) -> bool {
    use broadcast::error::TryRecvError;
    match rx.try_recv() {
        Ok(()) => true,
        Err(TryRecvError::Closed) => true,
        Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) => false,
    }
}
