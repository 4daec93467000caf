//! # Token Manager
//!
//! Issues, validates, persists and refreshes signed time-limited tokens, and
//! lets a user who has logged in online before log in again offline.
//!
//! ## Token Lifecycle (per user)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Token State Machine                              │
//! │                                                                         │
//! │   NoToken ──issue()──► Issued ──┬──► Valid ───────────────┐            │
//! │      ▲                          │                         │            │
//! │      │                          └──► Expired              │            │
//! │      │                                  │                 │            │
//! │      │                        refresh() │                 │            │
//! │      │                                  ▼                 │            │
//! │      │                 ┌──────── Refreshed ──────► Valid ◄┘            │
//! │      │                 │                                               │
//! │      └── revoke() ◄── RefreshFailed                                    │
//! │                                                                         │
//! │  CHECKS (validate):                                                    │
//! │  1. Signature + structure (HS256)                                      │
//! │  2. Expiry: now >= exp is expired, no leeway                           │
//! │  3. Identity: must be the token currently persisted for `sub`          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Refresh only trusts claims from a token whose signature verifies. Expiry
//! is ignored for refresh, signature and identity are not.
//!
//! Concurrent callers that hit an auth failure for the same user share a
//! single refresh through [`TokenManager::refresh_session`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use keystone_core::{AuthToken, OfflineCredential};
use keystone_db::LocalStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::error::{SyncError, SyncResult};

/// Claim names owned by the token manager. Caller claims with these names
/// are dropped.
pub const RESERVED_CLAIMS: &[&str] = &["sub", "username", "iat", "exp", "jti"];

// =============================================================================
// Claims
// =============================================================================

/// Token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user_id)
    pub sub: String,

    pub username: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// Unique token id
    pub jti: String,

    /// Caller-supplied claims (roles, site scope, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }
}

// =============================================================================
// Token Manager
// =============================================================================

/// Issues and verifies tokens, persisting them in the Local Store.
pub struct TokenManager {
    store: LocalStore,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    /// Per-user single-flight guards for session refresh.
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    refreshes: AtomicU64,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("ttl_secs", &self.ttl.num_seconds())
            .field("refresh_count", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Creates a manager signing with `secret`, issuing tokens valid for `ttl`.
    pub fn new(store: LocalStore, secret: &str, ttl: Duration) -> Self {
        TokenManager {
            store,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            refresh_locks: Mutex::new(HashMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn from_settings(store: LocalStore, settings: &AuthSettings) -> Self {
        Self::new(store, &settings.secret_key, settings.token_ttl())
    }

    /// Number of refreshes actually performed.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Issue / Validate
    // =========================================================================

    /// Issues and persists a token for `user_id`, superseding any previous
    /// one.
    pub async fn issue(
        &self,
        user_id: &str,
        username: &str,
        claims: Map<String, Value>,
    ) -> SyncResult<AuthToken> {
        let mut extra = claims;
        extra.retain(|key, _| {
            let reserved = RESERVED_CLAIMS.contains(&key.as_str());
            if reserved {
                warn!(claim = %key, "Dropping caller claim with reserved name");
            }
            !reserved
        });

        let token = self.sign(user_id, username, extra)?;
        self.store.store_token(&token).await?;

        info!(user_id = %user_id, expires_at = %token.expires_at, "Token issued");
        Ok(token)
    }

    /// Verifies a token and returns its claims.
    ///
    /// ## Errors
    /// - `TokenInvalid`: bad signature or structure, or no longer the
    ///   persisted token for its user
    /// - `TokenExpired`: `now >= exp`
    pub async fn validate(&self, token: &str) -> SyncResult<Claims> {
        let claims = self.decode_verified(token)?;

        if claims.is_expired_at(Utc::now()) {
            debug!(user_id = %claims.sub, "Token expired");
            return Err(SyncError::TokenExpired);
        }

        self.ensure_current(&claims.sub, token).await?;
        Ok(claims)
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Re-issues a token with a new id and expiry.
    ///
    /// The old token may be expired but its signature must verify and it must
    /// still be the persisted token for its user. Claims come only from the
    /// verified payload. On failure nothing is written.
    pub async fn refresh(&self, token: &str) -> SyncResult<AuthToken> {
        let claims = self.decode_verified(token)?;
        self.ensure_current(&claims.sub, token).await?;

        let fresh = self.sign(&claims.sub, &claims.username, claims.extra)?;
        self.store.store_token(&fresh).await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        info!(user_id = %fresh.user_id, expires_at = %fresh.expires_at, "Token refreshed");
        Ok(fresh)
    }

    /// Refreshes the session of `user_id` after `stale_token` was rejected.
    ///
    /// Callers racing on the same user wait for one refresh. A caller that
    /// arrives after the token was already replaced gets the new token
    /// without another refresh. If the refresh itself fails the session is
    /// revoked and `AuthError` is returned.
    pub async fn refresh_session(&self, user_id: &str, stale_token: &str) -> SyncResult<AuthToken> {
        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(user_id.to_string()).or_default().clone()
        };
        let _guard = lock.lock().await;

        let Some(current) = self.store.load_token(user_id).await? else {
            return Err(SyncError::AuthError(format!(
                "no session for user {user_id}, login required"
            )));
        };

        if current.token != stale_token {
            debug!(user_id = %user_id, "Session already refreshed by another caller");
            return Ok(current);
        }

        match self.refresh(stale_token).await {
            Ok(fresh) => Ok(fresh),
            Err(e) if e.is_auth_error() => {
                warn!(user_id = %user_id, error = %e, "Session refresh failed, revoking");
                self.revoke(user_id).await?;
                Err(SyncError::AuthError(format!("refresh failed: {e}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Current token for `user_id`, refreshed first if it has expired.
    pub async fn current_token(&self, user_id: &str) -> SyncResult<AuthToken> {
        let Some(token) = self.store.load_token(user_id).await? else {
            return Err(SyncError::AuthError(format!(
                "no token for user {user_id}, login required"
            )));
        };

        if token.is_expired_at(Utc::now()) {
            debug!(user_id = %user_id, "Persisted token expired, refreshing");
            return self.refresh_session(user_id, &token.token).await;
        }

        Ok(token)
    }

    /// Deletes the user's token (logout). Returns whether one existed.
    pub async fn revoke(&self, user_id: &str) -> SyncResult<bool> {
        let removed = self.store.delete_token(user_id).await?;
        info!(user_id = %user_id, removed, "Token revoked");
        Ok(removed)
    }

    // =========================================================================
    // Offline Login
    // =========================================================================

    /// Stores an argon2 hash of the password so the user can log in offline.
    pub async fn register_credentials(
        &self,
        username: &str,
        user_id: &str,
        password: &str,
        claims: Map<String, Value>,
    ) -> SyncResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| SyncError::Internal(format!("Failed to hash password: {e}")))?;

        self.store
            .credentials()
            .upsert(&OfflineCredential {
                username: username.to_string(),
                user_id: user_id.to_string(),
                password_hash: hash.to_string(),
                claims,
                updated_at: Utc::now(),
            })
            .await?;

        debug!(username = %username, "Offline credentials registered");
        Ok(())
    }

    /// Verifies the password against the stored hash and issues a token.
    pub async fn login_offline(&self, username: &str, password: &str) -> SyncResult<AuthToken> {
        let Some(credential) = self.store.credentials().find(username).await? else {
            return Err(SyncError::AuthError("invalid username or password".into()));
        };

        let parsed = PasswordHash::new(&credential.password_hash)
            .map_err(|e| SyncError::Internal(format!("Corrupt password hash: {e}")))?;

        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            warn!(username = %username, "Offline login rejected");
            return Err(SyncError::AuthError("invalid username or password".into()));
        }

        info!(username = %username, "Offline login");
        self.issue(&credential.user_id, &credential.username, credential.claims)
            .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn sign(&self, user_id: &str, username: &str, extra: Map<String, Value>) -> SyncResult<AuthToken> {
        let now = Utc::now();
        let issued_at = DateTime::from_timestamp(now.timestamp(), 0)
            .ok_or_else(|| SyncError::Internal("clock out of range".into()))?;
        let expires_at = issued_at + self.ttl;

        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            extra,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| SyncError::Internal(format!("Failed to sign token: {e}")))?;

        Ok(AuthToken {
            user_id: user_id.to_string(),
            token,
            issued_at,
            expires_at,
            refresh_token: None,
        })
    }

    /// Signature and structure only. Expiry is checked by the caller.
    fn decode_verified(&self, token: &str) -> SyncResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        // `aud` and `iss` are caller claims, carried but never enforced
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp"]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| SyncError::TokenInvalid(e.to_string()))
    }

    async fn ensure_current(&self, user_id: &str, token: &str) -> SyncResult<()> {
        match self.store.load_token(user_id).await? {
            Some(stored) if stored.token == token => Ok(()),
            Some(_) => Err(SyncError::TokenInvalid("token has been superseded".into())),
            None => Err(SyncError::TokenInvalid("token has been revoked".into())),
        }
    }
}
