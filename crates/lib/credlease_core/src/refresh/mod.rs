//! Lease-guarded token refresh.
//!
//! [`RefreshOrchestrator`] is the only path that talks to the token
//! provider. Every provider call happens while this attempt holds the lease
//! for the server, and the lease is released on every exit path.
//!
//! # Outcomes
//!
//! - lease held elsewhere → [`RefreshError::LockBusy`]
//! - lease lost before the new tokens were written →
//!   [`RefreshError::LockNotOwned`]
//! - timeout, network error, 5xx → [`RefreshError::Retryable`]
//! - request refused for a reason other than the token →
//!   [`RefreshError::Rejected`]
//! - refresh token rejected → record marked unauthorized,
//!   [`RefreshError::Unauthorized`]
//! - storage failure → [`RefreshError::Persistence`]
//!
//! The whole attempt under the lease (re-read, provider call, write) is
//! bounded by `refresh_timeout`, which is kept below the lease TTL.

pub mod provider;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LeaseConfig, to_chrono};
use crate::lease::{LeaseContext, LeaseError, LeaseManager};
use crate::models::{CredentialRecord, TokenSet};
use crate::store::StoreError;

use provider::{ProviderError, TokenProvider};
use retry::RetryPolicy;

/// Refresh errors.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Lease for {0} is held by another refresh attempt")]
    LockBusy(String),

    #[error("Lease for {0} was lost before the refreshed tokens were written")]
    LockNotOwned(String),

    #[error("Transient refresh failure for {server_id}: {reason}")]
    Retryable { server_id: String, reason: String },

    #[error("Token request for {server_id} rejected: {reason}")]
    Rejected { server_id: String, reason: String },

    #[error("Server {0} requires re-authorization")]
    Unauthorized(String),

    #[error("No credential stored for server {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl RefreshError {
    /// Lost or busy leases and transient provider failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RefreshError::LockBusy(_)
                | RefreshError::LockNotOwned(_)
                | RefreshError::Retryable { .. }
        )
    }
}

impl From<LeaseError> for RefreshError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::Busy(server_id) => RefreshError::LockBusy(server_id),
            LeaseError::NotOwned { server_id, .. } => RefreshError::LockBusy(server_id),
            LeaseError::Store(e) => RefreshError::Persistence(e),
        }
    }
}

/// Successful refresh result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RefreshOutcome {
    /// The provider issued new tokens and they were persisted.
    Refreshed(TokenSet),
    /// Another attempt refreshed while this one waited for the lease; no
    /// provider call was made.
    AlreadyFresh(TokenSet),
}

impl RefreshOutcome {
    pub fn tokens(&self) -> &TokenSet {
        match self {
            RefreshOutcome::Refreshed(t) | RefreshOutcome::AlreadyFresh(t) => t,
        }
    }

    pub fn into_tokens(self) -> TokenSet {
        match self {
            RefreshOutcome::Refreshed(t) | RefreshOutcome::AlreadyFresh(t) => t,
        }
    }
}

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Lease TTL; must exceed `refresh_timeout`.
    pub lease_ttl: chrono::Duration,
    /// Upper bound on everything one attempt does while holding the lease.
    pub refresh_timeout: Duration,
    /// Tokens expiring within this window count as due for refresh.
    pub refresh_before_expiry: chrono::Duration,
}

impl From<&LeaseConfig> for RefreshSettings {
    fn from(config: &LeaseConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl_chrono(),
            refresh_timeout: config.refresh_timeout,
            refresh_before_expiry: to_chrono(config.refresh_before_expiry),
        }
    }
}

/// Acquire lease → call provider → persist → release.
pub struct RefreshOrchestrator {
    leases: LeaseManager,
    provider: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    settings: RefreshSettings,
}

impl RefreshOrchestrator {
    pub fn new(
        leases: LeaseManager,
        provider: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            leases,
            provider,
            retry,
            settings,
        }
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// One refresh attempt. Always calls the provider once the lease is held.
    pub async fn refresh(&self, server_id: &str) -> Result<RefreshOutcome, RefreshError> {
        self.attempt(server_id, true).await
    }

    /// [`Self::refresh`] under the retry policy. Only `LockBusy` and
    /// `Retryable` are retried; the lease is free between attempts.
    pub async fn refresh_with_retry(
        &self,
        server_id: &str,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.retrying(server_id, true).await
    }

    /// Return a usable access token, refreshing it first if it is inside
    /// the preemptive refresh window.
    ///
    /// If refreshing fails with a retryable error but the stored token has
    /// not actually expired yet, the stored token is returned.
    pub async fn get_fresh_token(&self, server_id: &str) -> Result<String, RefreshError> {
        let record = self.load(server_id).await?;
        let now = self.leases.clock().now();
        if !record.needs_refresh(now, self.settings.refresh_before_expiry) {
            return Ok(record.access_token);
        }

        match self.retrying(server_id, false).await {
            Ok(outcome) => Ok(outcome.into_tokens().access_token),
            Err(e) if e.is_retryable() => {
                // Another holder may have finished in the meantime.
                let current = self.load(server_id).await?;
                if current.expires_at > self.leases.clock().now() {
                    debug!(server_id, error = %e, "refresh deferred; current token still valid");
                    Ok(current.access_token)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn retrying(&self, server_id: &str, force: bool) -> Result<RefreshOutcome, RefreshError> {
        let mut attempt = 1;
        loop {
            match self.attempt(server_id, force).await {
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        server_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying token refresh"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn attempt(&self, server_id: &str, force: bool) -> Result<RefreshOutcome, RefreshError> {
        // Short-circuit before touching the lease or the provider.
        self.load(server_id).await?;

        self.leases
            .run_leased(server_id, self.settings.lease_ttl, |ctx| {
                self.bounded_refresh(ctx, force)
            })
            .await?
    }

    /// Give up on the work before the lease can go stale under it.
    async fn bounded_refresh(
        &self,
        ctx: LeaseContext,
        force: bool,
    ) -> Result<RefreshOutcome, RefreshError> {
        let server_id = ctx.server_id.clone();
        let limit = self.settings.refresh_timeout;
        match tokio::time::timeout(limit, self.refresh_under_lease(ctx, force)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                self.leases.metrics().record_refresh_retryable();
                warn!(
                    server_id = %server_id,
                    timeout_ms = limit.as_millis() as u64,
                    "token refresh timed out"
                );
                Err(RefreshError::Retryable {
                    server_id,
                    reason: format!("refresh did not finish within {limit:?}"),
                })
            }
        }
    }

    async fn refresh_under_lease(
        &self,
        ctx: LeaseContext,
        force: bool,
    ) -> Result<RefreshOutcome, RefreshError> {
        let server_id = ctx.server_id.as_str();
        let store = self.leases.store();
        let metrics = self.leases.metrics();

        // Re-read under the lease: the previous holder may have refreshed
        // or revoked since the first read.
        let record = self.load(server_id).await?;
        if !force
            && !record.needs_refresh(self.leases.clock().now(), self.settings.refresh_before_expiry)
        {
            debug!(server_id, "token already refreshed by another holder");
            return Ok(RefreshOutcome::AlreadyFresh(current_tokens(&record)));
        }

        let Some(refresh_token) = record.refresh_token.clone() else {
            warn!(server_id, "no refresh token stored; marking unauthorized");
            store.mark_unauthorized(server_id).await?;
            metrics.record_refresh_unauthorized();
            return Err(RefreshError::Unauthorized(server_id.to_string()));
        };

        match self.provider.refresh(server_id, &refresh_token).await {
            Ok(tokens) => {
                let written = store
                    .write_tokens(
                        server_id,
                        &ctx.holder_id,
                        &tokens.access_token,
                        tokens.refresh_token.as_deref(),
                        tokens.expires_at,
                    )
                    .await?;
                if !written {
                    metrics.record_refresh_retryable();
                    warn!(
                        server_id,
                        holder_id = %ctx.holder_id,
                        "lease lost during refresh; discarding new tokens"
                    );
                    return Err(RefreshError::LockNotOwned(server_id.to_string()));
                }
                metrics.record_refresh_success();
                info!(
                    server_id,
                    holder_id = %ctx.holder_id,
                    expires_at = %tokens.expires_at,
                    rotated = tokens.refresh_token.is_some(),
                    "token refreshed"
                );
                Ok(RefreshOutcome::Refreshed(TokenSet {
                    refresh_token: tokens.refresh_token.or(Some(refresh_token)),
                    ..tokens
                }))
            }
            Err(ProviderError::Transient(reason)) => {
                metrics.record_refresh_retryable();
                warn!(server_id, %reason, "transient refresh failure");
                Err(RefreshError::Retryable {
                    server_id: server_id.to_string(),
                    reason,
                })
            }
            Err(ProviderError::Rejected(reason)) => {
                metrics.record_refresh_rejected();
                warn!(server_id, %reason, "token request rejected; credential left authorized");
                Err(RefreshError::Rejected {
                    server_id: server_id.to_string(),
                    reason,
                })
            }
            Err(ProviderError::Permanent(reason)) => {
                // Marked while the lease is still held so no other attempt
                // can present the rejected token in between.
                store.mark_unauthorized(server_id).await?;
                metrics.record_refresh_unauthorized();
                warn!(server_id, %reason, "refresh token rejected; re-authorization required");
                Err(RefreshError::Unauthorized(server_id.to_string()))
            }
        }
    }

    /// Read the record and reject missing or unauthorized credentials.
    async fn load(&self, server_id: &str) -> Result<CredentialRecord, RefreshError> {
        let record = self
            .leases
            .store()
            .read_credential(server_id)
            .await?
            .ok_or_else(|| RefreshError::NotFound(server_id.to_string()))?;
        if !record.is_authorized() {
            return Err(RefreshError::Unauthorized(server_id.to_string()));
        }
        Ok(record)
    }
}

fn current_tokens(record: &CredentialRecord) -> TokenSet {
    TokenSet {
        access_token: record.access_token.clone(),
        refresh_token: record.refresh_token.clone(),
        expires_at: record.expires_at,
    }
}
