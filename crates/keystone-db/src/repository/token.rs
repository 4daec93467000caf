//! # Token Repository
//!
//! At most one token per user is persisted. Storing a token for a user
//! supersedes the previous one in the same statement.

use chrono::{DateTime, Utc};
use keystone_core::AuthToken;
use sqlx::SqlitePool;
use tracing::debug;

use crate::crypto::PayloadCipher;
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    user_id: String,
    token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    refresh_token: Option<String>,
}

/// Repository for persisted auth tokens.
#[derive(Debug, Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
    cipher: PayloadCipher,
}

impl TokenRepository {
    pub fn new(pool: SqlitePool, cipher: PayloadCipher) -> Self {
        TokenRepository { pool, cipher }
    }

    /// Persists the user's token, superseding any previous one.
    pub async fn store(&self, token: &AuthToken) -> DbResult<()> {
        let sealed = self.cipher.seal(&token.token)?;
        let refresh = self.cipher.seal_opt(token.refresh_token.as_deref())?;

        sqlx::query(
            r#"
            INSERT INTO auth_tokens (user_id, token, issued_at, expires_at, refresh_token)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
                token = excluded.token,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                refresh_token = excluded.refresh_token
            "#,
        )
        .bind(&token.user_id)
        .bind(sealed)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(refresh)
        .execute(&self.pool)
        .await?;

        debug!(user_id = %token.user_id, expires_at = %token.expires_at, "Stored token");
        Ok(())
    }

    /// Loads the user's token, if any.
    pub async fn load(&self, user_id: &str) -> DbResult<Option<AuthToken>> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT user_id, token, issued_at, expires_at, refresh_token
            FROM auth_tokens
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(AuthToken {
            user_id: row.user_id,
            token: self.cipher.open(&row.token)?,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            refresh_token: self.cipher.open_opt(row.refresh_token.as_deref())?,
        }))
    }

    /// Deletes the user's token. Returns whether one existed.
    pub async fn delete(&self, user_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM auth_tokens WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        debug!(user_id = %user_id, deleted = result.rows_affected() > 0, "Deleted token");
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{DbConfig, LocalStore};
    use chrono::Duration;

    fn token(user: &str, value: &str) -> AuthToken {
        let now = Utc::now();
        AuthToken {
            user_id: user.to_string(),
            token: value.to_string(),
            issued_at: now,
            expires_at: now + Duration::days(1),
            refresh_token: Some(format!("{value}-refresh")),
        }
    }

    #[tokio::test]
    async fn test_store_supersedes() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        let tokens = store.tokens();

        tokens.store(&token("u1", "first")).await.unwrap();
        tokens.store(&token("u1", "second")).await.unwrap();
        tokens.store(&token("u2", "other")).await.unwrap();

        let loaded = tokens.load("u1").await.unwrap().unwrap();
        assert_eq!(loaded.token, "second");
        assert_eq!(loaded.refresh_token.as_deref(), Some("second-refresh"));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_tokens")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = LocalStore::open(DbConfig::in_memory()).await.unwrap();
        store.store_token(&token("u1", "t")).await.unwrap();

        assert!(store.delete_token("u1").await.unwrap());
        assert!(!store.delete_token("u1").await.unwrap());
        assert!(store.load_token("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_encrypted_token_column() {
        let store = LocalStore::open(DbConfig::in_memory().encryption_key("pw"))
            .await
            .unwrap();
        store.store_token(&token("u1", "eyJhbGciOi.secret.sig")).await.unwrap();

        let raw: String = sqlx::query_scalar("SELECT token FROM auth_tokens")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(!raw.contains("secret"));
        assert_eq!(
            store.load_token("u1").await.unwrap().unwrap().token,
            "eyJhbGciOi.secret.sig"
        );
    }
}
