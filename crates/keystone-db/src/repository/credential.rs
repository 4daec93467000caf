//! # Offline Credential Repository
//!
//! Argon2 hashes of user passwords, so a user who has logged in online once
//! can log in again without network. Hashing and verification happen in the
//! token manager; this repository only stores PHC strings.

use chrono::{DateTime, Utc};
use keystone_core::OfflineCredential;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    username: String,
    user_id: String,
    password_hash: String,
    claims: String,
    updated_at: DateTime<Utc>,
}

/// Repository for offline credentials.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CredentialRepository { pool }
    }

    /// Inserts or replaces the credential for a username.
    pub async fn upsert(&self, credential: &OfflineCredential) -> DbResult<()> {
        let claims = serde_json::to_string(&credential.claims)?;

        sqlx::query(
            r#"
            INSERT INTO offline_credentials (username, user_id, password_hash, claims, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(username) DO UPDATE SET
                user_id = excluded.user_id,
                password_hash = excluded.password_hash,
                claims = excluded.claims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.username)
        .bind(&credential.user_id)
        .bind(&credential.password_hash)
        .bind(claims)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(username = %credential.username, "Stored offline credential");
        Ok(())
    }

    pub async fn find(&self, username: &str) -> DbResult<Option<OfflineCredential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT username, user_id, password_hash, claims, updated_at
            FROM offline_credentials
            WHERE username = ?1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        Ok(Some(OfflineCredential {
            username: r.username,
            user_id: r.user_id,
            password_hash: r.password_hash,
            claims: serde_json::from_str(&r.claims)?,
            updated_at: r.updated_at,
        }))
    }

    pub async fn delete(&self, username: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM offline_credentials WHERE username = ?1")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
