//! Admin session gate.
//!
//! Tokens are opaque random keys handed out after a PIN check. Only their
//! SHA-256 hash is stored. A token is valid while it is at most `ttl` old;
//! there is no revocation list.

use crate::store::{StoreError, TokenStore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Header carrying the admin token on HTTP-style transports.
pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 168;

/// Gate behaviour for requests that carry no token at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    /// Missing token is rejected.
    #[default]
    Enforcing,
    /// Missing token is accepted. Present-but-invalid tokens are still rejected.
    Development,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Authorized,
    Unauthorized,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminToken {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Compare a provided PIN with the configured one in constant time.
pub fn verify_pin(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && provided
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[derive(Debug, Clone, Copy)]
pub struct AdminGate {
    mode: GateMode,
    ttl: Duration,
}

impl Default for AdminGate {
    fn default() -> Self {
        Self::new(GateMode::Enforcing, Duration::hours(DEFAULT_TOKEN_TTL_HOURS))
    }
}

impl AdminGate {
    pub fn new(mode: GateMode, ttl: Duration) -> Self {
        if mode == GateMode::Development {
            tracing::warn!(
                "admin gate in development mode: requests without a token are authorized"
            );
        }
        Self { mode, ttl }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Mint and persist a new token. The caller has already checked the PIN.
    pub async fn issue<S: TokenStore + ?Sized>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<AdminToken, StoreError> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        store.insert_token(&hash_token(&token), now).await?;
        tracing::info!(created_at = %now, "admin token issued");
        Ok(AdminToken {
            token,
            created_at: now,
            expires_at: now + self.ttl,
        })
    }

    /// An empty string counts as an absent token.
    pub async fn validate<S: TokenStore + ?Sized>(
        &self,
        store: &S,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Authorization, StoreError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(match self.mode {
                GateMode::Development => Authorization::Authorized,
                GateMode::Enforcing => Authorization::Unauthorized,
            });
        };

        let Some(created_at) = store.token_created_at(&hash_token(token)).await? else {
            tracing::debug!("unknown admin token");
            return Ok(Authorization::Unauthorized);
        };

        if now - created_at <= self.ttl {
            Ok(Authorization::Authorized)
        } else {
            tracing::debug!(%created_at, "expired admin token");
            Ok(Authorization::Unauthorized)
        }
    }
}
