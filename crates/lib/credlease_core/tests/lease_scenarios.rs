//! End-to-end lease scenarios over the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use credlease_core::clock::{Clock, ManualClock};
use credlease_core::config::LeaseConfig;
use credlease_core::lease::LeaseManager;
use credlease_core::metrics::LeaseMetrics;
use credlease_core::models::TokenSet;
use credlease_core::reaper::StaleLeaseReaper;
use credlease_core::refresh::provider::{ProviderError, TokenProvider};
use credlease_core::refresh::{RefreshError, RefreshOrchestrator, RefreshSettings};
use credlease_core::scheduler::ReaperScheduler;
use credlease_core::store::{LockStore, MemoryLockStore};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

struct World {
    store: Arc<MemoryLockStore>,
    clock: Arc<ManualClock>,
    metrics: Arc<LeaseMetrics>,
    config: LeaseConfig,
}

impl World {
    async fn with_servers(ids: &[&str]) -> Self {
        let store = Arc::new(MemoryLockStore::new());
        for id in ids {
            store
                .store_credential(id, "at-0", Some("rt-0"), t(30))
                .await
                .unwrap();
        }
        Self {
            store,
            clock: Arc::new(ManualClock::new(t(0))),
            metrics: Arc::new(LeaseMetrics::new()),
            config: LeaseConfig::default(),
        }
    }

    fn manager(&self, instance: &str) -> LeaseManager {
        LeaseManager::new(
            self.store.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            instance,
        )
    }

    fn reaper(&self) -> StaleLeaseReaper {
        StaleLeaseReaper::new(self.store.clone(), self.clock.clone(), self.metrics.clone())
    }

    fn orchestrator(&self, instance: &str, provider: Arc<dyn TokenProvider>) -> RefreshOrchestrator {
        RefreshOrchestrator::new(
            self.manager(instance),
            provider,
            self.config.retry_policy(),
            RefreshSettings::from(&self.config),
        )
    }
}

/// Rejects every refresh token.
struct RevokedProvider {
    calls: AtomicU32,
}

#[async_trait]
impl TokenProvider for RevokedProvider {
    async fn refresh(&self, _server_id: &str, _refresh_token: &str) -> Result<TokenSet, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Permanent("HTTP 400: invalid_grant".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_across_instances_have_one_winner() {
    let world = World::with_servers(&["srv"]).await;
    let ttl = world.config.lease_ttl_chrono();

    let mut handles = Vec::new();
    for i in 0..16 {
        let manager = world.manager(&format!("replica-{i}"));
        handles.push(tokio::spawn(async move { manager.lease("srv", ttl).await }));
    }

    let mut guards = Vec::new();
    for handle in handles {
        if let Ok(guard) = handle.await.unwrap() {
            guards.push(guard);
        }
    }
    assert_eq!(guards.len(), 1);

    let winner = guards.pop().unwrap();
    let record = world.store.read_credential("srv").await.unwrap().unwrap();
    assert_eq!(record.lease_holder_id(), Some(winner.holder_id()));

    assert!(winner.release().await.unwrap());
    let record = world.store.read_credential("srv").await.unwrap().unwrap();
    assert!(record.lease.is_none());
}

#[tokio::test]
async fn crashed_holder_is_recovered_by_reaper() {
    let world = World::with_servers(&["srv"]).await;
    let ttl = chrono::Duration::seconds(60);
    let a = world.manager("a");
    let b = world.manager("b");
    let reaper = world.reaper();

    // A acquires at t=0 and then "crashes": its guard is leaked.
    let guard_a = a.lease("srv", ttl).await.unwrap();
    let holder_a = guard_a.holder_id().to_string();
    std::mem::forget(guard_a);

    world.clock.set(t(30));
    assert!(reaper.reap_now(ttl).await.unwrap().cleared.is_empty());
    assert!(b.lease("srv", ttl).await.is_err());

    world.clock.set(t(70));
    let report = reaper.reap_now(ttl).await.unwrap();
    assert_eq!(report.cleared, vec!["srv".to_string()]);

    world.clock.set(t(71));
    let guard_b = b.lease("srv", ttl).await.unwrap();
    assert_eq!(guard_b.acquired_at(), t(71));

    // A late release from A must not clear B's lease.
    assert!(!a.release("srv", &holder_a).await.unwrap());
    let record = world.store.read_credential("srv").await.unwrap().unwrap();
    assert_eq!(record.lease_holder_id(), Some(guard_b.holder_id()));

    assert!(guard_b.release().await.unwrap());
}

#[tokio::test]
async fn permanent_rejection_requires_reauthorization() {
    let world = World::with_servers(&["srv"]).await;
    let provider = Arc::new(RevokedProvider {
        calls: AtomicU32::new(0),
    });
    let orchestrator = world.orchestrator("replica-1", provider.clone());

    let err = orchestrator.refresh_with_retry("srv").await.unwrap_err();
    assert!(matches!(err, RefreshError::Unauthorized(_)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let record = world.store.read_credential("srv").await.unwrap().unwrap();
    assert!(!record.is_authorized());
    assert!(record.lease.is_none());

    // The lease is still usable by anyone.
    let guard = world
        .manager("replica-2")
        .lease("srv", world.config.lease_ttl_chrono())
        .await
        .unwrap();
    assert!(guard.release().await.unwrap());

    // Refresh refuses without calling the provider again.
    let err = orchestrator.get_fresh_token("srv").await.unwrap_err();
    assert!(matches!(err, RefreshError::Unauthorized(_)));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // Re-authorization restores normal operation.
    world
        .store
        .store_credential("srv", "at-new", Some("rt-new"), world.clock.now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(orchestrator.get_fresh_token("srv").await.unwrap(), "at-new");

    let snap = world.metrics.snapshot();
    assert_eq!(snap.refresh_unauthorized, 1);
    assert_eq!(snap.acquired, snap.released);
}

#[tokio::test(start_paused = true)]
async fn scheduler_reaps_in_the_background() {
    let world = World::with_servers(&["a", "b"]).await;
    let ttl = chrono::Duration::seconds(60);
    world.store.acquire_lease("a", "crashed", t(0), ttl).await.unwrap();

    let scheduler = ReaperScheduler::new(world.reaper());
    assert!(scheduler.start(Duration::from_secs(30), Duration::from_secs(90)));
    assert!(!scheduler.start(Duration::from_secs(30), Duration::from_secs(90)));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(world.store.read_credential("a").await.unwrap().unwrap().lease.is_some());

    world.clock.set(t(91));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(world.store.read_credential("a").await.unwrap().unwrap().lease.is_none());

    let status = scheduler.status();
    assert!(status.running);
    assert_eq!(status.passes, 2);
    assert_eq!(status.total_cleared, 1);

    scheduler.stop().await;
    assert!(!scheduler.is_running());
}
