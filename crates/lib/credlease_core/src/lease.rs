//! Lease acquire / renew / release on top of a [`LockStore`].
//!
//! A lease is granted by one conditional write and cleared by one
//! compare-and-clear, both executed by the store. [`LeaseManager::run_leased`]
//! wraps a unit of work so that the lease is released on every exit path:
//! normal return, panic inside the work, and cancellation of the caller's
//! future (via [`LeaseGuard`]'s `Drop`).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::metrics::LeaseMetrics;
use crate::store::{LockStore, StoreError};

/// Lease errors.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Lease for {0} is held by another holder")]
    Busy(String),

    #[error("Lease for {server_id} is no longer owned by {holder_id}")]
    NotOwned { server_id: String, holder_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acquire / renew / release semantics over a shared [`LockStore`].
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LeaseMetrics>,
    instance: String,
}

impl LeaseManager {
    /// `instance` prefixes every holder id this manager generates.
    pub fn new(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LeaseMetrics>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            instance: instance.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    /// Grant the lease if free or older than `ttl`.
    pub async fn acquire(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .acquire_lease(server_id, holder_id, now, ttl)
            .await?;
        if acquired {
            self.metrics.record_acquired();
            debug!(server_id, holder_id, "lease acquired");
        } else {
            self.metrics.record_busy();
            debug!(server_id, holder_id, "lease busy");
        }
        Ok(acquired)
    }

    /// Compare-and-clear. A non-owner release is logged and returns `false`.
    pub async fn release(&self, server_id: &str, holder_id: &str) -> Result<bool, StoreError> {
        release_lease(self.store.as_ref(), &self.metrics, server_id, holder_id).await
    }

    /// Move the lease's acquisition time to `now` if still owned.
    pub async fn renew(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let renewed = self.store.renew_lease(server_id, holder_id, now).await?;
        if renewed {
            self.metrics.record_renewed();
            debug!(server_id, holder_id, "lease renewed");
        } else {
            warn!(server_id, holder_id, "renew ignored: lease not owned");
        }
        Ok(renewed)
    }

    /// Acquire a lease under a fresh holder id and return its guard.
    pub async fn lease(
        &self,
        server_id: &str,
        ttl: chrono::Duration,
    ) -> Result<LeaseGuard, LeaseError> {
        let holder_id = crate::uuid::holder_id(&self.instance);
        let now = self.clock.now();
        if !self.acquire(server_id, &holder_id, now, ttl).await? {
            return Err(LeaseError::Busy(server_id.to_string()));
        }
        Ok(LeaseGuard {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
            server_id: server_id.to_string(),
            holder_id,
            acquired_at: now,
            released: false,
        })
    }

    /// Run `work` while holding the lease for `server_id`, then release it.
    ///
    /// The release happens before the work's result is returned, and before a
    /// panic raised by the work is resumed. A failed release is logged and
    /// left to the reaper; it does not replace the work's result.
    pub async fn run_leased<F, Fut, T>(
        &self,
        server_id: &str,
        ttl: chrono::Duration,
        work: F,
    ) -> Result<T, LeaseError>
    where
        F: FnOnce(LeaseContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lease(server_id, ttl).await?;
        let ctx = LeaseContext {
            server_id: guard.server_id.clone(),
            holder_id: guard.holder_id.clone(),
            acquired_at: guard.acquired_at,
        };

        let outcome = AssertUnwindSafe(work(ctx)).catch_unwind().await;

        if let Err(e) = guard.release().await {
            error!(server_id, error = %e, "lease release failed; leaving it to the reaper");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Identity of a held lease, handed to the work run under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseContext {
    pub server_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// A held lease. Released exactly once: explicitly via [`LeaseGuard::release`],
/// or in the background when dropped unreleased.
pub struct LeaseGuard {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LeaseMetrics>,
    server_id: String,
    holder_id: String,
    acquired_at: DateTime<Utc>,
    released: bool,
}

impl LeaseGuard {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Extend the lease. Fails with [`LeaseError::NotOwned`] once reaped or
    /// taken over.
    pub async fn renew(&mut self) -> Result<(), LeaseError> {
        let now = self.clock.now();
        if self
            .store
            .renew_lease(&self.server_id, &self.holder_id, now)
            .await?
        {
            self.metrics.record_renewed();
            self.acquired_at = now;
            Ok(())
        } else {
            warn!(
                server_id = %self.server_id,
                holder_id = %self.holder_id,
                "renew ignored: lease not owned"
            );
            Err(LeaseError::NotOwned {
                server_id: self.server_id.clone(),
                holder_id: self.holder_id.clone(),
            })
        }
    }

    /// Release the lease. Returns `false` if it had already been reaped.
    pub async fn release(mut self) -> Result<bool, StoreError> {
        // Marked only after the store answers: if this future is dropped
        // mid-flight, `Drop` still schedules the release.
        let result = release_lease(
            self.store.as_ref(),
            &self.metrics,
            &self.server_id,
            &self.holder_id,
        )
        .await;
        self.released = true;
        result
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let server_id = std::mem::take(&mut self.server_id);
        let holder_id = std::mem::take(&mut self.holder_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(%server_id, %holder_id, "lease guard dropped; releasing in background");
                handle.spawn(async move {
                    if let Err(e) =
                        release_lease(store.as_ref(), &metrics, &server_id, &holder_id).await
                    {
                        error!(%server_id, error = %e, "background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(%server_id, %holder_id, "lease guard dropped outside a runtime; leaving it to the reaper");
            }
        }
    }
}

async fn release_lease(
    store: &dyn LockStore,
    metrics: &LeaseMetrics,
    server_id: &str,
    holder_id: &str,
) -> Result<bool, StoreError> {
    let released = store.release_lease(server_id, holder_id).await?;
    if released {
        metrics.record_released();
        debug!(server_id, holder_id, "lease released");
    } else {
        metrics.record_release_not_owned();
        warn!(
            server_id,
            holder_id, "release ignored: lease no longer owned (reaped or taken over)"
        );
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryLockStore;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn ttl() -> chrono::Duration {
        chrono::Duration::seconds(60)
    }

    async fn setup() -> (LeaseManager, Arc<MemoryLockStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryLockStore::new());
        store
            .store_credential("srv", "at", Some("rt"), t(3600))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(t(0)));
        let mgr = LeaseManager::new(
            store.clone(),
            clock.clone(),
            Arc::new(LeaseMetrics::new()),
            "test",
        );
        (mgr, store, clock)
    }

    #[tokio::test]
    async fn acquire_and_release_update_metrics() {
        let (mgr, _store, _clock) = setup().await;
        assert!(mgr.acquire("srv", "a", t(0), ttl()).await.unwrap());
        assert!(!mgr.acquire("srv", "b", t(1), ttl()).await.unwrap());
        assert!(!mgr.release("srv", "b").await.unwrap());
        assert!(mgr.release("srv", "a").await.unwrap());

        let snap = mgr.metrics().snapshot();
        assert_eq!(snap.acquired, 1);
        assert_eq!(snap.busy, 1);
        assert_eq!(snap.released, 1);
        assert_eq!(snap.release_not_owned, 1);
    }

    #[tokio::test]
    async fn lease_is_busy_while_held() {
        let (mgr, _store, _clock) = setup().await;
        let guard = mgr.lease("srv", ttl()).await.unwrap();
        assert!(guard.holder_id().starts_with("test:"));
        assert!(matches!(
            mgr.lease("srv", ttl()).await,
            Err(LeaseError::Busy(id)) if id == "srv"
        ));
        assert!(guard.release().await.unwrap());
        assert!(mgr.lease("srv", ttl()).await.is_ok());
    }

    #[tokio::test]
    async fn guard_renew_fails_after_takeover() {
        let (mgr, store, clock) = setup().await;
        let mut guard = mgr.lease("srv", ttl()).await.unwrap();

        clock.set(t(30));
        guard.renew().await.unwrap();
        assert_eq!(guard.acquired_at(), t(30));

        // Another attempt force-acquires once the renewed lease goes stale.
        assert!(store.acquire_lease("srv", "other", t(91), ttl()).await.unwrap());
        assert!(matches!(
            guard.renew().await,
            Err(LeaseError::NotOwned { .. })
        ));
        // Releasing the lost lease is a harmless no-op.
        assert!(!guard.release().await.unwrap());
        let rec = store.read_credential("srv").await.unwrap().unwrap();
        assert_eq!(rec.lease_holder_id(), Some("other"));
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let (mgr, store, _clock) = setup().await;
        let guard = mgr.lease("srv", ttl()).await.unwrap();
        drop(guard);
        // Let the spawned release run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let rec = store.read_credential("srv").await.unwrap().unwrap();
        assert!(rec.lease.is_none());
    }

    #[tokio::test]
    async fn run_leased_releases_after_work() {
        let (mgr, store, _clock) = setup().await;
        let store_in = store.clone();
        let holder = mgr
            .run_leased("srv", ttl(), |ctx| async move {
                let rec = store_in.read_credential(&ctx.server_id).await.unwrap().unwrap();
                assert_eq!(rec.lease_holder_id(), Some(ctx.holder_id.as_str()));
                ctx.holder_id
            })
            .await
            .unwrap();
        assert!(holder.starts_with("test:"));
        let rec = store.read_credential("srv").await.unwrap().unwrap();
        assert!(rec.lease.is_none());
        assert_eq!(mgr.metrics().snapshot().released, 1);
    }

    fn explode() -> u32 {
        panic!("provider blew up")
    }

    #[tokio::test]
    async fn run_leased_releases_before_resuming_panic() {
        let (mgr, store, _clock) = setup().await;
        let mgr_task = mgr.clone();
        let joined = tokio::spawn(async move {
            mgr_task
                .run_leased("srv", ttl(), |_ctx| async move { explode() })
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        let rec = store.read_credential("srv").await.unwrap().unwrap();
        assert!(rec.lease.is_none());
    }

    #[tokio::test]
    async fn run_leased_reports_busy_without_running_work() {
        let (mgr, _store, _clock) = setup().await;
        let _held = mgr.lease("srv", ttl()).await.unwrap();
        let mut ran = false;
        let result = mgr
            .run_leased("srv", ttl(), |_ctx| {
                ran = true;
                async {}
            })
            .await;
        assert!(matches!(result, Err(LeaseError::Busy(_))));
        assert!(!ran);
    }
}
