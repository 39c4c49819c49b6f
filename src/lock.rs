//! Best-effort worker lease over the shared store.
//!
//! A lease is a `{holderId, acquiredAt}` record. The holder bumps the
//! timestamp on a short interval; anyone may take it over once the heartbeat
//! is older than the timeout. The store has no compare-and-swap, so two
//! workers that both observe a stale lease can both write one. `acquire`
//! re-reads after writing, which shrinks that window to the store's
//! round-trip but does not close it: both may still see their own write
//! before the other lands. The loser finds out on its next renewal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::{duration_ms, Clock};
use crate::store::{load_json, save_json, KvStore};

/// Opaque token naming one worker for the lifetime of its process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    /// Use a fixed token, e.g. from configuration.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("worker-{}", hex::encode(bytes)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stored lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder_id: String,
    /// Epoch milliseconds of the last heartbeat.
    pub acquired_at: i64,
}

/// Lease timing.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    pub timeout: Duration,
    pub renew_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: crate::constants::LOCK_TIMEOUT,
            renew_interval: crate::constants::LOCK_RENEW_INTERVAL,
        }
    }
}

/// Acquires, renews and releases the single worker lease.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    identity: WorkerIdentity,
    key: String,
    config: LockConfig,
}

impl LockManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        identity: WorkerIdentity,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            clock,
            identity,
            key: crate::constants::LOCK_KEY.to_string(),
            config,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    #[must_use]
    pub fn config(&self) -> LockConfig {
        self.config
    }

    fn is_stale(&self, lease: &Lease, now: i64) -> bool {
        now - lease.acquired_at > duration_ms(self.config.timeout)
    }

    /// Try to hold the lease.
    ///
    /// Returns true when the caller holds it afterwards: freshly acquired,
    /// renewed because the caller already held it, or taken over from a
    /// holder whose heartbeat went stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn acquire(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        let current = self.read_lease().await?;

        match current {
            Some(lease) if lease.holder_id == self.identity.as_str() => {
                self.write_lease(now).await?;
                Ok(true)
            }
            Some(lease) if !self.is_stale(&lease, now) => {
                debug!(holder = %lease.holder_id, "Lease held by another worker");
                Ok(false)
            }
            previous => {
                if let Some(stale) = previous {
                    debug!(
                        previous = %stale.holder_id,
                        age_ms = now - stale.acquired_at,
                        "Taking over stale lease"
                    );
                }
                self.write_lease(now).await?;
                let confirmed = self
                    .read_lease()
                    .await?
                    .is_some_and(|l| l.holder_id == self.identity.as_str());
                if !confirmed {
                    debug!("Lost lease race on read-back");
                }
                Ok(confirmed)
            }
        }
    }

    /// Delete the lease if, and only if, the caller holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release(&self) -> Result<()> {
        match self.read_lease().await? {
            Some(lease) if lease.holder_id == self.identity.as_str() => {
                self.store.delete(&self.key).await?;
                debug!(holder = %self.identity, "Lease released");
            }
            Some(lease) => {
                debug!(holder = %lease.holder_id, "Not releasing a lease held by another worker");
            }
            None => {}
        }
        Ok(())
    }

    /// Whether the stored lease names this worker and is still fresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn is_holder(&self) -> Result<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .read_lease()
            .await?
            .is_some_and(|l| l.holder_id == self.identity.as_str() && !self.is_stale(&l, now)))
    }

    /// Start the heartbeat task.
    ///
    /// The task calls [`acquire`](Self::acquire) every renewal interval while
    /// this worker holds the lease and stops on its own once it does not.
    /// Dropping the handle stops it as well.
    #[must_use]
    pub fn start_renewal(&self) -> RenewalHandle {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.renew_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                match manager.is_holder().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(holder = %manager.identity, "Lease no longer held, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        warn!("Lease check failed: {e:#}");
                        continue;
                    }
                }
                match manager.acquire().await {
                    Ok(true) => debug!(holder = %manager.identity, "Lease renewed"),
                    Ok(false) => {
                        warn!(holder = %manager.identity, "Lease renewal refused, stopping renewal");
                        break;
                    }
                    Err(e) => warn!("Lease renewal failed: {e:#}"),
                }
            }
        });
        RenewalHandle { handle }
    }

    async fn read_lease(&self) -> Result<Option<Lease>> {
        match load_json::<Lease>(self.store.as_ref(), &self.key).await {
            Ok(lease) => Ok(lease),
            Err(e) => {
                // An unreadable lease is treated as absent so it can be overwritten.
                warn!("Ignoring corrupt lease record: {e:#}");
                Ok(None)
            }
        }
    }

    async fn write_lease(&self, now: i64) -> Result<()> {
        let lease = Lease {
            holder_id: self.identity.as_str().to_string(),
            acquired_at: now,
        };
        save_json(self.store.as_ref(), &self.key, &lease).await
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Stops the heartbeat task when dropped.
#[derive(Debug)]
pub struct RenewalHandle {
    handle: JoinHandle<()>,
}

impl RenewalHandle {
    /// Whether the heartbeat task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
