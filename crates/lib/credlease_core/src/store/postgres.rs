//! PostgreSQL lock store.
//!
//! Each lease transition is one `UPDATE … WHERE <precondition>` statement.
//! Under READ COMMITTED, concurrent updates of the same row serialize on the
//! row lock and the loser re-evaluates the `WHERE` clause against the
//! winner's version, so at most one conditional acquire succeeds.
//!
//! Token columns hold AES-256-GCM ciphertext bound to the row's server id
//! (see [`super::secrets`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::secrets::TokenCipher;
use super::{LockStore, StoreError};
use crate::models::{AuthorizationState, CredentialRecord, Lease};

/// Database row for `oauth_credentials`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct CredentialRow {
    server_id: String,
    access_token_encrypted: String,
    refresh_token_encrypted: Option<String>,
    expires_at: DateTime<Utc>,
    lease_holder_id: Option<String>,
    lease_acquired_at: Option<DateTime<Utc>>,
    authorization_state: String,
    updated_at: DateTime<Utc>,
}

/// sqlx-backed [`LockStore`].
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl PgLockStore {
    pub fn new(pool: PgPool, encryption_key: &str) -> Self {
        Self {
            pool,
            cipher: TokenCipher::new(encryption_key),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode(&self, row: CredentialRow) -> Result<CredentialRecord, StoreError> {
        let lease = match (row.lease_holder_id, row.lease_acquired_at) {
            (Some(holder_id), Some(acquired_at)) => Some(Lease {
                holder_id,
                acquired_at,
            }),
            (None, None) => None,
            _ => {
                return Err(StoreError::InvalidRecord(format!(
                    "{}: lease holder and acquisition time must be set together",
                    row.server_id
                )));
            }
        };
        let refresh_token = match row.refresh_token_encrypted.as_deref() {
            Some(enc) => Some(self.cipher.open(&row.server_id, enc)?),
            None => None,
        };
        Ok(CredentialRecord {
            access_token: self.cipher.open(&row.server_id, &row.access_token_encrypted)?,
            refresh_token,
            expires_at: row.expires_at,
            lease,
            authorization_state: AuthorizationState::from_db(&row.authorization_state),
            updated_at: row.updated_at,
            server_id: row.server_id,
        })
    }

    fn seal_opt(&self, server_id: &str, value: Option<&str>) -> Result<Option<String>, StoreError> {
        value.map(|v| self.cipher.seal(server_id, v)).transpose()
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn acquire_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_credentials
            SET lease_holder_id = $2,
                lease_acquired_at = $3
            WHERE server_id = $1
              AND (lease_holder_id IS NULL OR lease_acquired_at < $4)
            "#,
        )
        .bind(server_id)
        .bind(holder_id)
        .bind(now)
        .bind(now - ttl)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, server_id: &str, holder_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_credentials
            SET lease_holder_id = NULL,
                lease_acquired_at = NULL
            WHERE server_id = $1 AND lease_holder_id = $2
            "#,
        )
        .bind(server_id)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        server_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_credentials
            SET lease_acquired_at = $3
            WHERE server_id = $1 AND lease_holder_id = $2
            "#,
        )
        .bind(server_id)
        .bind(holder_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_stale_leases(
        &self,
        threshold_time: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut cleared = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE oauth_credentials
            SET lease_holder_id = NULL,
                lease_acquired_at = NULL
            WHERE lease_acquired_at < $1
            RETURNING server_id
            "#,
        )
        .bind(threshold_time)
        .fetch_all(&self.pool)
        .await?;
        cleared.sort();
        Ok(cleared)
    }

    async fn read_credential(
        &self,
        server_id: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT server_id, access_token_encrypted, refresh_token_encrypted,
                   expires_at, lease_holder_id, lease_acquired_at,
                   authorization_state, updated_at
            FROM oauth_credentials
            WHERE server_id = $1
            "#,
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.decode(r)).transpose()
    }

    async fn write_tokens(
        &self,
        server_id: &str,
        holder_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let access_enc = self.cipher.seal(server_id, access_token)?;
        let refresh_enc = self.seal_opt(server_id, refresh_token)?;
        let result = sqlx::query(
            r#"
            UPDATE oauth_credentials
            SET access_token_encrypted = $3,
                refresh_token_encrypted = COALESCE($4, refresh_token_encrypted),
                expires_at = $5,
                updated_at = now()
            WHERE server_id = $1 AND lease_holder_id = $2
            "#,
        )
        .bind(server_id)
        .bind(holder_id)
        .bind(&access_enc)
        .bind(refresh_enc.as_deref())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_unauthorized(&self, server_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE oauth_credentials
            SET authorization_state = $2,
                updated_at = now()
            WHERE server_id = $1
            "#,
        )
        .bind(server_id)
        .bind(AuthorizationState::Unauthorized.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(server_id.to_string()));
        }
        Ok(())
    }

    async fn store_credential(
        &self,
        server_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let access_enc = self.cipher.seal(server_id, access_token)?;
        let refresh_enc = self.seal_opt(server_id, refresh_token)?;
        sqlx::query(
            r#"
            INSERT INTO oauth_credentials
                (server_id, access_token_encrypted, refresh_token_encrypted,
                 expires_at, authorization_state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (server_id)
            DO UPDATE SET access_token_encrypted = EXCLUDED.access_token_encrypted,
                          refresh_token_encrypted = EXCLUDED.refresh_token_encrypted,
                          expires_at = EXCLUDED.expires_at,
                          authorization_state = EXCLUDED.authorization_state,
                          updated_at = now()
            "#,
        )
        .bind(server_id)
        .bind(&access_enc)
        .bind(refresh_enc.as_deref())
        .bind(expires_at)
        .bind(AuthorizationState::Authorized.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
