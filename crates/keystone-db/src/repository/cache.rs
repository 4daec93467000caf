//! # Response Cache Repository
//!
//! Last known server response per endpoint, served while offline.
//! Last write wins; a local mutation on the same endpoint invalidates the
//! entry so stale data is never shown as current.

use chrono::{DateTime, Utc};
use keystone_core::validation::validate_endpoint;
use keystone_core::CachedResponse;
use sqlx::SqlitePool;
use tracing::debug;

use crate::crypto::PayloadCipher;
use crate::error::DbResult;

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    endpoint: String,
    payload: String,
    cached_at: DateTime<Utc>,
}

/// Repository for cached responses.
#[derive(Debug, Clone)]
pub struct CacheRepository {
    pool: SqlitePool,
    cipher: PayloadCipher,
}

impl CacheRepository {
    pub fn new(pool: SqlitePool, cipher: PayloadCipher) -> Self {
        CacheRepository { pool, cipher }
    }

    /// Stores the response for an endpoint, replacing any previous one.
    pub async fn put(&self, endpoint: &str, payload: &serde_json::Value) -> DbResult<()> {
        validate_endpoint(endpoint)?;
        let sealed = self.cipher.seal(&serde_json::to_string(payload)?)?;

        sqlx::query(
            r#"
            INSERT INTO response_cache (endpoint, payload, cached_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(endpoint) DO UPDATE SET
                payload = excluded.payload,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(endpoint)
        .bind(sealed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(endpoint = %endpoint, "Cached response");
        Ok(())
    }

    /// Cached response for an endpoint, if any.
    pub async fn get(&self, endpoint: &str) -> DbResult<Option<CachedResponse>> {
        let row: Option<CacheRow> = sqlx::query_as(
            "SELECT endpoint, payload, cached_at FROM response_cache WHERE endpoint = ?1",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload = serde_json::from_str(&self.cipher.open(&row.payload)?)?;
        Ok(Some(CachedResponse {
            endpoint: row.endpoint,
            payload,
            cached_at: row.cached_at,
        }))
    }

    /// Drops the entry for an endpoint. Returns whether one existed.
    pub async fn invalidate(&self, endpoint: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM response_cache WHERE endpoint = ?1")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drops every entry.
    pub async fn clear(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM response_cache")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
