//! Leased mutual exclusion per connector+collection
//!
//! The [`LockCoordinator`] acquires a named lease through an external
//! [`LockManager`] and keeps it alive with a background refresh task for the
//! handle's lifetime. Acquisition failure is never fatal — it only delays the
//! caller, which retries on a fixed cadence until shutdown.
//!
//! Loss of the lease is a liveness signal, not a data-loss event: the holder
//! observes `is_held() == false` and winds down.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// External distributed lock manager, specified at its protocol boundary.
///
/// All operations are keyed by lease name plus an owner token so a manager
/// can reject refresh/release calls from a stale holder.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempt to take the lease. Returns false when another owner holds it.
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extend the lease TTL. Returns false when the caller no longer owns it.
    async fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Give the lease up. Must be a no-op for a non-owner.
    async fn release(&self, name: &str, owner: &str) -> Result<()>;
}

/// Shared lock manager handle.
pub type SharedLockManager = Arc<dyn LockManager>;

/// Timing knobs for lease handling.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease time-to-live granted on acquire/refresh
    pub lease_ttl: Duration,
    /// Fixed delay between failed acquisition attempts
    pub retry_delay: Duration,
    /// Cadence of the background refresh
    pub refresh_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            retry_delay: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(20),
        }
    }
}

/// Acquires leases with infinite fixed-delay retry and background refresh.
pub struct LockCoordinator {
    manager: SharedLockManager,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(manager: SharedLockManager, config: LockConfig) -> Self {
        Self { manager, config }
    }

    /// Acquire the named lease, retrying until it succeeds or shutdown is
    /// signalled. Returns `None` only on shutdown.
    ///
    /// Manager errors are transient infrastructure failures: logged, then
    /// retried after the fixed delay.
    pub async fn acquire_with_refresh(
        &self,
        name: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<LeaseHandle> {
        let owner = Uuid::new_v4().to_string();

        loop {
            match self
                .manager
                .try_acquire(name, &owner, self.config.lease_ttl)
                .await
            {
                Ok(true) => {
                    info!("Acquired lease '{}' as owner {}", name, owner);
                    return Some(LeaseHandle::start(
                        self.manager.clone(),
                        name.to_string(),
                        owner,
                        self.config.clone(),
                    ));
                }
                Ok(false) => {
                    debug!("Lease '{}' held elsewhere, retrying", name);
                }
                Err(e) => {
                    warn!("Lock manager error acquiring '{}': {}", name, e);
                }
            }

            tokio::select! {
                _ = sleep(self.config.retry_delay) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown while waiting for lease '{}'", name);
                    return None;
                }
            }
        }
    }
}

/// A held lease with its background refresh task.
///
/// Dropping the handle aborts the refresh task; the lease itself then lapses
/// at TTL expiry. Call [`release`](LeaseHandle::release) for a prompt,
/// idempotent hand-back.
pub struct LeaseHandle {
    manager: SharedLockManager,
    name: String,
    owner: String,
    held: Arc<AtomicBool>,
    released: AtomicBool,
    refresh_task: JoinHandle<()>,
}

impl LeaseHandle {
    fn start(
        manager: SharedLockManager,
        name: String,
        owner: String,
        config: LockConfig,
    ) -> Self {
        let held = Arc::new(AtomicBool::new(true));

        // The refresh task outlives individual controller loop iterations; it
        // keeps `held` honest until the lease is lost or released. A refresh
        // rejection or manager error both count as loss — an uncertain holder
        // must not keep publishing.
        let refresh_task = tokio::spawn({
            let manager = manager.clone();
            let name = name.clone();
            let owner = owner.clone();
            let held = held.clone();
            async move {
                let mut ticker = tokio::time::interval(config.refresh_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    match manager.refresh(&name, &owner, config.lease_ttl).await {
                        Ok(true) => {
                            debug!("Refreshed lease '{}'", name);
                        }
                        Ok(false) => {
                            warn!("Lease '{}' no longer owned, marking lost", name);
                            held.store(false, Ordering::SeqCst);
                            return;
                        }
                        Err(e) => {
                            warn!("Lease '{}' refresh failed ({}), marking lost", name, e);
                            held.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        });

        Self {
            manager,
            name,
            owner,
            held,
            released: AtomicBool::new(false),
            refresh_task,
        }
    }

    /// Lease name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the lease is still held. False after loss or release.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Hand the lease back. Idempotent; a failed release is logged and left
    /// to TTL expiry.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.refresh_task.abort();
        self.held.store(false, Ordering::SeqCst);
        if let Err(e) = self.manager.release(&self.name, &self.owner).await {
            warn!("Failed to release lease '{}': {}", self.name, e);
        } else {
            info!("Released lease '{}'", self.name);
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

/// TTL-expiring in-memory lock manager.
///
/// Guarantees mutual exclusion within one process; suitable for tests and
/// single-node deployments.
#[derive(Default)]
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

struct LeaseEntry {
    owner: String,
    expires_at: Instant,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        match leases.get(name) {
            Some(entry) if entry.expires_at > now && entry.owner != owner => Ok(false),
            _ => {
                leases.insert(
                    name.to_string(),
                    LeaseEntry {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn refresh(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        match leases.get_mut(name) {
            Some(entry) if entry.owner == owner && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|e| e.owner == owner) {
            leases.remove(name);
        }
        Ok(())
    }
}
