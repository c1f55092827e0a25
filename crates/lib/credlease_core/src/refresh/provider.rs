//! External token provider.
//!
//! The orchestrator only needs one operation: exchange a refresh token for
//! new token material. Failures fall into three classes: transient, a
//! request the provider refused for reasons other than the token, and
//! revocation of the refresh token itself. The caller bounds the call with a
//! timeout.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::models::TokenSet;

/// Lifetime assumed when the provider omits `expires_in` (1 hour).
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Provider failure classes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network error, timeout, 5xx, 408 or 429. Worth retrying.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider refused the request, but not because of the refresh
    /// token (`invalid_client`, `invalid_request`, ...). Not retried, and the
    /// credential stays authorized.
    #[error("Token request rejected: {0}")]
    Rejected(String),

    /// The refresh token itself is invalid or revoked (`invalid_grant`).
    /// Re-authorization needed.
    #[error("Refresh token rejected: {0}")]
    Permanent(String),
}

/// Exchanges a refresh token for fresh credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh(&self, server_id: &str, refresh_token: &str)
    -> Result<TokenSet, ProviderError>;
}

// =============================================================================
// HTTP provider
// =============================================================================

/// Successful response from an OAuth token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Convert to a [`TokenSet`] with `expires_at` relative to `now`.
    pub fn into_token_set(self, now: DateTime<Utc>) -> TokenSet {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + chrono::Duration::seconds(expires_in),
        }
    }
}

/// RFC 6749 error body.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// RFC 6749 §5.2 error code for an invalid, expired or revoked grant.
const INVALID_GRANT: &str = "invalid_grant";

/// Classify a non-success token endpoint response.
///
/// 5xx, 408 and 429 are transient. Only `invalid_grant` condemns the refresh
/// token; every other 4xx is [`ProviderError::Rejected`].
pub fn classify_error_response(status: StatusCode, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let detail = match &parsed {
        Some(ErrorResponse {
            error,
            error_description: Some(desc),
        }) => format!("HTTP {status}: {error}: {desc}"),
        Some(ErrorResponse { error, .. }) => format!("HTTP {status}: {error}"),
        None => format!("HTTP {status}: {body}"),
    };

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return ProviderError::Transient(detail);
    }
    match parsed {
        Some(ErrorResponse { error, .. }) if error == INVALID_GRANT => {
            ProviderError::Permanent(detail)
        }
        _ => ProviderError::Rejected(detail),
    }
}

/// `grant_type=refresh_token` form post against a single token endpoint.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    clock: Arc<dyn Clock>,
}

impl HttpTokenProvider {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            clock,
        }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn refresh(
        &self,
        server_id: &str,
        refresh_token: &str,
    ) -> Result<TokenSet, ProviderError> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        debug!(server_id, token_url = %self.token_url, "requesting token refresh");

        let resp = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Token refresh failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_error_response(status, &body));
        }

        let parsed = resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProviderError::Transient(format!("Token refresh parse error: {e}")))?;

        Ok(parsed.into_token_set(self.clock.now()))
    }
}
