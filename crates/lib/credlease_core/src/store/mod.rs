//! Credential persistence with atomic lease operations.
//!
//! Every lease transition is a single conditional write executed by the
//! store. Nothing above this layer holds a process-local mutex, so the
//! protocol stays correct when callers run in different processes.
//!
//! Two realizations are provided:
//!
//! - [`postgres::PgLockStore`]: conditional `UPDATE … WHERE` on the
//!   `oauth_credentials` row; tokens encrypted at rest.
//! - [`memory::MemoryLockStore`]: per-key shard lock on a `DashMap`, for
//!   single-process deployments and tests.

pub mod memory;
pub mod postgres;
pub mod secrets;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::CredentialRecord;

pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;

/// Persistence errors. Surfaced immediately; never retried in this crate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Atomic conditional operations over credential records.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Grant the lease to `holder_id` if the record has no holder, or its
    /// current lease was acquired before `now - ttl`.
    ///
    /// Returns `false` if a live lease is held (by anyone, including
    /// `holder_id` itself) or if no record exists for `server_id`.
    async fn acquire_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError>;

    /// Clear the lease only if `holder_id` still owns it.
    async fn release_lease(&self, server_id: &str, holder_id: &str) -> Result<bool, StoreError>;

    /// Move `lease_acquired_at` to `now` only if `holder_id` still owns it.
    async fn renew_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear every lease acquired strictly before `threshold_time`, without
    /// checking holders. Returns the ids whose lease was cleared.
    async fn clear_stale_leases(
        &self,
        threshold_time: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    async fn read_credential(&self, server_id: &str)
    -> Result<Option<CredentialRecord>, StoreError>;

    /// Persist refreshed tokens only if `holder_id` still owns the lease.
    /// A `None` refresh token keeps the stored one.
    ///
    /// Returns `false`, writing nothing, if the lease was reaped or taken
    /// over, or if no record exists for `server_id`.
    async fn write_tokens(
        &self,
        server_id: &str,
        holder_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Flag the record as needing human re-authorization.
    async fn mark_unauthorized(&self, server_id: &str) -> Result<(), StoreError>;

    /// Insert or replace a credential after an external (re-)authorization.
    ///
    /// Sets the record back to authorized and leaves any lease in place.
    async fn store_credential(
        &self,
        server_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
