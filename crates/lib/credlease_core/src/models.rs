//! Credential domain models.
//!
//! One [`CredentialRecord`] exists per connected external service. The lease
//! fields live on the record itself rather than in a separate lock table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Enums
// =============================================================================

/// Whether the stored refresh token is still usable.
///
/// `Unauthorized` is terminal inside this crate: only an external
/// re-authorization flow (see [`crate::store::LockStore::store_credential`])
/// moves a record back to `Authorized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationState {
    Authorized,
    Unauthorized,
}

impl AuthorizationState {
    /// Column value used by the PostgreSQL store.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationState::Authorized => "authorized",
            AuthorizationState::Unauthorized => "unauthorized",
        }
    }

    /// Parse a column value; anything unknown is treated as unauthorized.
    pub fn from_db(value: &str) -> Self {
        match value {
            "authorized" => AuthorizationState::Authorized,
            _ => AuthorizationState::Unauthorized,
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// An exclusive, time-bounded refresh grant on one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// A lease is stale once it was acquired strictly before `cutoff`.
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.acquired_at < cutoff
    }
}

/// The credential held on behalf of one connected server.
///
/// Holder and acquisition time are modelled as a single `Option<Lease>` so
/// that one cannot be set without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub server_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub authorization_state: AuthorizationState,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Build a freshly authorized record with no lease.
    pub fn authorized(
        server_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            access_token: access_token.into(),
            refresh_token,
            expires_at,
            lease: None,
            authorization_state: AuthorizationState::Authorized,
            updated_at: now,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.authorization_state == AuthorizationState::Authorized
    }

    pub fn lease_holder_id(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.holder_id.as_str())
    }

    pub fn lease_acquired_at(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.acquired_at)
    }

    /// True when the access token expires within `window` of `now`
    /// (or has already expired).
    pub fn needs_refresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.expires_at <= now + window
    }
}

/// Token material returned by a provider refresh.
///
/// `refresh_token` is `None` when the provider did not rotate it; the stored
/// refresh token is then kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}
