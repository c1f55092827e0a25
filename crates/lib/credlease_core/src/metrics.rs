//! Lease and refresh counters.
//!
//! Plain atomics shared through an `Arc`; a [`MetricsSnapshot`] is taken for
//! logging or JSON output.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the lease manager, orchestrator and reaper.
#[derive(Debug, Default)]
pub struct LeaseMetrics {
    acquired: AtomicU64,
    busy: AtomicU64,
    released: AtomicU64,
    release_not_owned: AtomicU64,
    renewed: AtomicU64,
    reaped: AtomicU64,
    reap_passes: AtomicU64,
    refresh_success: AtomicU64,
    refresh_retryable: AtomicU64,
    refresh_unauthorized: AtomicU64,
    refresh_rejected: AtomicU64,
}

/// Point-in-time copy of [`LeaseMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub acquired: u64,
    pub busy: u64,
    pub released: u64,
    pub release_not_owned: u64,
    pub renewed: u64,
    pub reaped: u64,
    pub reap_passes: u64,
    pub refresh_success: u64,
    pub refresh_retryable: u64,
    pub refresh_unauthorized: u64,
    pub refresh_rejected: u64,
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release_not_owned(&self) {
        self.release_not_owned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renewed(&self) {
        self.renewed.fetch_add(1, Ordering::Relaxed);
    }

    /// One reaper pass that cleared `count` leases.
    pub fn record_reap(&self, count: usize) {
        self.reap_passes.fetch_add(1, Ordering::Relaxed);
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_refresh_success(&self) {
        self.refresh_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_retryable(&self) {
        self.refresh_retryable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_unauthorized(&self) {
        self.refresh_unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_rejected(&self) {
        self.refresh_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            release_not_owned: self.release_not_owned.load(Ordering::Relaxed),
            renewed: self.renewed.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            reap_passes: self.reap_passes.load(Ordering::Relaxed),
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_retryable: self.refresh_retryable.load(Ordering::Relaxed),
            refresh_unauthorized: self.refresh_unauthorized.load(Ordering::Relaxed),
            refresh_rejected: self.refresh_rejected.load(Ordering::Relaxed),
        }
    }
}
