//! In-process lock store.
//!
//! Each conditional write happens while holding the `DashMap` shard lock for
//! its key, which makes it atomic with respect to every other operation in
//! the same process. Only suitable when all callers share one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{LockStore, StoreError};
use crate::models::{AuthorizationState, CredentialRecord, Lease};

/// `DashMap`-backed [`LockStore`].
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: DashMap<String, CredentialRecord>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Insert or replace a full record, lease fields included.
    pub fn insert(&self, record: CredentialRecord) {
        self.records.insert(record.server_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_mut(server_id) else {
            return Ok(false);
        };
        let free = match &record.lease {
            None => true,
            Some(lease) => lease.is_older_than(now - ttl),
        };
        if free {
            record.lease = Some(Lease {
                holder_id: holder_id.to_string(),
                acquired_at: now,
            });
        }
        Ok(free)
    }

    async fn release_lease(&self, server_id: &str, holder_id: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_mut(server_id) else {
            return Ok(false);
        };
        if record.lease_holder_id() == Some(holder_id) {
            record.lease = None;
            return Ok(true);
        }
        Ok(false)
    }

    async fn renew_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_mut(server_id) else {
            return Ok(false);
        };
        match record.lease.as_mut() {
            Some(lease) if lease.holder_id == holder_id => {
                lease.acquired_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_stale_leases(
        &self,
        threshold_time: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut cleared = Vec::new();
        for mut entry in self.records.iter_mut() {
            let stale = entry
                .lease
                .as_ref()
                .is_some_and(|lease| lease.is_older_than(threshold_time));
            if stale {
                entry.lease = None;
                cleared.push(entry.key().clone());
            }
        }
        cleared.sort();
        Ok(cleared)
    }

    async fn read_credential(
        &self,
        server_id: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.records.get(server_id).map(|r| r.value().clone()))
    }

    async fn write_tokens(
        &self,
        server_id: &str,
        holder_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.records.get_mut(server_id) else {
            return Ok(false);
        };
        if record.lease_holder_id() != Some(holder_id) {
            return Ok(false);
        }
        record.access_token = access_token.to_string();
        if let Some(rt) = refresh_token {
            record.refresh_token = Some(rt.to_string());
        }
        record.expires_at = expires_at;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_unauthorized(&self, server_id: &str) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(server_id)
            .ok_or_else(|| StoreError::NotFound(server_id.to_string()))?;
        record.authorization_state = AuthorizationState::Unauthorized;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn store_credential(
        &self,
        server_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.records
            .entry(server_id.to_string())
            .and_modify(|record| {
                record.access_token = access_token.to_string();
                record.refresh_token = refresh_token.map(str::to_string);
                record.expires_at = expires_at;
                record.authorization_state = AuthorizationState::Authorized;
                record.updated_at = now;
            })
            .or_insert_with(|| {
                CredentialRecord::authorized(
                    server_id,
                    access_token,
                    refresh_token.map(str::to_string),
                    expires_at,
                    now,
                )
            });
        Ok(())
    }
}
