//! Stale-lease reaper.
//!
//! Clears leases whose holder has not released or renewed them within the
//! stale threshold, so that a crashed process cannot block refresh forever.
//! Passes are idempotent and may run redundantly on several instances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::metrics::LeaseMetrics;
use crate::store::{LockStore, StoreError};

/// Result of one reaper pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Clock reading the pass ran at.
    pub ran_at: DateTime<Utc>,
    /// Leases acquired strictly before this instant were cleared.
    pub cutoff: DateTime<Utc>,
    /// Server ids whose lease was cleared.
    pub cleared: Vec<String>,
}

#[derive(Clone)]
pub struct StaleLeaseReaper {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LeaseMetrics>,
}

impl StaleLeaseReaper {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, metrics: Arc<LeaseMetrics>) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    /// Clear every lease acquired before `now - threshold`, regardless of
    /// holder.
    pub async fn reap(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Result<ReapReport, StoreError> {
        let cutoff = now - threshold;
        let cleared = self.store.clear_stale_leases(cutoff).await?;
        self.metrics.record_reap(cleared.len());

        if cleared.is_empty() {
            debug!(%cutoff, "no stale leases");
        } else {
            info!(%cutoff, count = cleared.len(), server_ids = ?cleared, "cleared stale leases");
        }

        Ok(ReapReport {
            ran_at: now,
            cutoff,
            cleared,
        })
    }

    /// [`Self::reap`] at the clock's current time.
    pub async fn reap_now(&self, threshold: chrono::Duration) -> Result<ReapReport, StoreError> {
        self.reap(self.clock.now(), threshold).await
    }
}
