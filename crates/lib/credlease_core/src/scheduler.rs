//! Periodic execution of [`StaleLeaseReaper`] passes.
//!
//! [`ReaperScheduler`] owns at most one background task. `start` is
//! idempotent, `stop` cancels the task and waits for it, and the pair can be
//! cycled any number of times.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::to_chrono;
use crate::reaper::StaleLeaseReaper;

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_ms: Option<u64>,
    pub threshold_ms: Option<u64>,
    /// Passes completed since construction, failed ones included.
    pub passes: u64,
    pub total_cleared: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error of the most recent pass, cleared by the next successful one.
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct PassStats {
    passes: u64,
    total_cleared: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
    threshold: Duration,
}

/// Runs reaper passes on a fixed interval.
pub struct ReaperScheduler {
    reaper: StaleLeaseReaper,
    running: Mutex<Option<Running>>,
    stats: Arc<Mutex<PassStats>>,
}

impl ReaperScheduler {
    pub fn new(reaper: StaleLeaseReaper) -> Self {
        Self {
            reaper,
            running: Mutex::new(None),
            stats: Arc::new(Mutex::new(PassStats::default())),
        }
    }

    /// Spawn the reaper loop: one pass immediately, then one per `interval`.
    ///
    /// Returns `false` without side effects when already running or when
    /// `interval` is zero. Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration, threshold: Duration) -> bool {
        if interval.is_zero() {
            warn!("reaper interval must be non-zero; scheduler not started");
            return false;
        }
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            info!("reaper scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.reaper.clone(),
            Arc::clone(&self.stats),
            interval,
            to_chrono(threshold),
            cancel.clone(),
        ));
        *running = Some(Running {
            cancel,
            handle,
            interval,
            threshold,
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            threshold_ms = threshold.as_millis() as u64,
            "reaper scheduler started"
        );
        true
    }

    /// Cancel the loop and wait for it to exit. No-op when not running.
    ///
    /// A pass already in progress finishes before the loop exits.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            debug!("reaper scheduler not running");
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "reaper task ended abnormally");
        }
        info!("reaper scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn status(&self) -> SchedulerStatus {
        let (running, interval_ms, threshold_ms) = match lock(&self.running).as_ref() {
            Some(r) if !r.handle.is_finished() => (
                true,
                Some(r.interval.as_millis() as u64),
                Some(r.threshold.as_millis() as u64),
            ),
            _ => (false, None, None),
        };
        let stats = lock(&self.stats);
        SchedulerStatus {
            running,
            interval_ms,
            threshold_ms,
            passes: stats.passes,
            total_cleared: stats.total_cleared,
            last_run_at: stats.last_run_at,
            last_error: stats.last_error.clone(),
        }
    }
}

impl Drop for ReaperScheduler {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

async fn run_loop(
    reaper: StaleLeaseReaper,
    stats: Arc<Mutex<PassStats>>,
    interval: Duration,
    threshold: chrono::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = reaper.reap_now(threshold).await;

        let mut s = lock(&stats);
        s.passes += 1;
        match result {
            Ok(report) => {
                s.total_cleared += report.cleared.len() as u64;
                s.last_run_at = Some(report.ran_at);
                s.last_error = None;
            }
            Err(e) => {
                // Keep going; the next tick retries.
                error!(error = %e, "reaper pass failed");
                s.last_error = Some(e.to_string());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::LeaseMetrics;
    use crate::models::CredentialRecord;
    use crate::store::{LockStore, MemoryLockStore, StoreError};

    const INTERVAL: Duration = Duration::from_secs(30);
    const THRESHOLD: Duration = Duration::from_secs(90);

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduler_over(store: Arc<dyn LockStore>) -> (ReaperScheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t(0)));
        let reaper = StaleLeaseReaper::new(store, clock.clone(), Arc::new(LeaseMetrics::new()));
        (ReaperScheduler::new(reaper), clock)
    }

    fn scheduler() -> ReaperScheduler {
        scheduler_over(Arc::new(MemoryLockStore::new())).0
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_interval() {
        let s = scheduler();
        assert!(s.start(INTERVAL, THRESHOLD));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(s.status().passes, 1);

        // Passes at 0, 30, 60 and 90 seconds.
        tokio::time::sleep(Duration::from_secs(94)).await;
        assert_eq!(s.status().passes, 4);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_keeps_a_single_timer() {
        let s = scheduler();
        assert!(s.start(INTERVAL, THRESHOLD));
        assert!(!s.start(INTERVAL, THRESHOLD));
        assert!(!s.start(Duration::from_secs(1), THRESHOLD));

        tokio::time::sleep(Duration::from_secs(95)).await;
        let status = s.status();
        assert_eq!(status.passes, 4);
        assert_eq!(status.interval_ms, Some(30_000));
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_resumes() {
        let s = scheduler();
        assert!(!s.is_running());

        assert!(s.start(INTERVAL, THRESHOLD));
        assert!(s.is_running());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(s.status().passes, 2);

        s.stop().await;
        assert!(!s.is_running());
        assert!(!s.status().running);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(s.status().passes, 2);

        assert!(s.start(INTERVAL, THRESHOLD));
        assert!(s.is_running());
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(s.status().passes, 4);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_refused() {
        let s = scheduler();
        assert!(!s.start(Duration::ZERO, THRESHOLD));
        assert!(!s.is_running());
        assert_eq!(s.status().interval_ms, None);

        // A valid start afterwards still works.
        assert!(s.start(INTERVAL, THRESHOLD));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(s.status().passes, 1);
        s.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_no_op() {
        let s = scheduler();
        s.stop().await;
        s.stop().await;
        assert!(!s.is_running());
        assert_eq!(s.status().passes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn passes_clear_stale_leases() {
        let store = Arc::new(MemoryLockStore::new());
        store
            .store_credential("srv", "at", Some("rt"), t(3600))
            .await
            .unwrap();
        store
            .acquire_lease("srv", "crashed", t(0), chrono::Duration::seconds(60))
            .await
            .unwrap();
        let (s, clock) = scheduler_over(store.clone());
        clock.set(t(100));

        assert!(s.start(INTERVAL, THRESHOLD));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let rec = store.read_credential("srv").await.unwrap().unwrap();
        assert!(rec.lease.is_none());
        let status = s.status();
        assert_eq!(status.total_cleared, 1);
        assert_eq!(status.last_run_at, Some(t(100)));
        s.stop().await;
    }

    /// Fails `clear_stale_leases` while `failing` is set.
    struct FlakyStore {
        inner: MemoryLockStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl LockStore for FlakyStore {
        async fn acquire_lease(
            &self,
            server_id: &str,
            holder_id: &str,
            now: DateTime<Utc>,
            ttl: chrono::Duration,
        ) -> Result<bool, StoreError> {
            self.inner.acquire_lease(server_id, holder_id, now, ttl).await
        }

        async fn release_lease(&self, server_id: &str, holder_id: &str) -> Result<bool, StoreError> {
            self.inner.release_lease(server_id, holder_id).await
        }

        async fn renew_lease(
            &self,
            server_id: &str,
            holder_id: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.renew_lease(server_id, holder_id, now).await
        }

        async fn clear_stale_leases(
            &self,
            threshold_time: DateTime<Utc>,
        ) -> Result<Vec<String>, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidRecord("connection reset".into()));
            }
            self.inner.clear_stale_leases(threshold_time).await
        }

        async fn read_credential(
            &self,
            server_id: &str,
        ) -> Result<Option<CredentialRecord>, StoreError> {
            self.inner.read_credential(server_id).await
        }

        async fn write_tokens(
            &self,
            server_id: &str,
            holder_id: &str,
            access_token: &str,
            refresh_token: Option<&str>,
            expires_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner
                .write_tokens(server_id, holder_id, access_token, refresh_token, expires_at)
                .await
        }

        async fn mark_unauthorized(&self, server_id: &str) -> Result<(), StoreError> {
            self.inner.mark_unauthorized(server_id).await
        }

        async fn store_credential(
            &self,
            server_id: &str,
            access_token: &str,
            refresh_token: Option<&str>,
            expires_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner
                .store_credential(server_id, access_token, refresh_token, expires_at)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pass_is_recorded_and_loop_continues() {
        let store = Arc::new(FlakyStore {
            inner: MemoryLockStore::new(),
            failing: AtomicBool::new(true),
        });
        let (s, _clock) = scheduler_over(store.clone());

        assert!(s.start(INTERVAL, THRESHOLD));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = s.status();
        assert_eq!(status.passes, 1);
        assert!(status.last_error.unwrap().contains("connection reset"));
        assert!(s.is_running());

        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = s.status();
        assert_eq!(status.passes, 2);
        assert_eq!(status.last_error, None);
        s.stop().await;
    }
}
