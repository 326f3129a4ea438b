//! Authentication domain models.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Pending authorizations expire 10 minutes after creation.
pub const PENDING_AUTHORIZATION_TTL_SECS: i64 = 10 * 60;

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: account ID (standard JWT `sub` claim).
    pub sub: String,
    /// Token chain (login session) this access token belongs to.
    pub sid: String,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Issued at (unix timestamp).
    pub iat: i64,
}

/// An access/refresh token pair handed to a client.
///
/// The refresh token is only ever returned here in plaintext; the store keeps
/// its SHA-256 hash.
#[derive(Clone)]
pub struct TokenPair {
    pub subject_id: String,
    pub chain_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl TokenPair {
    /// Seconds until the access token expires, measured from issuance.
    pub fn expires_in(&self) -> i64 {
        (self.access_expires_at - self.issued_at).num_seconds()
    }
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("subject_id", &self.subject_id)
            .field("chain_id", &self.chain_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Why a token chain was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Logout,
    RefreshReuse,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::RefreshReuse => "refresh_reuse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logout" => Some(RevocationReason::Logout),
            "refresh_reuse" => Some(RevocationReason::RefreshReuse),
            _ => None,
        }
    }
}

/// One login session: every token pair issued through rotation shares it.
#[derive(Debug, Clone)]
pub struct TokenChain {
    pub id: String,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
}

impl TokenChain {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Mark the chain revoked. The first revocation wins; later calls are no-ops.
    pub fn revoke(&mut self, reason: RevocationReason, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        self.revoked_at = Some(now);
        self.revocation_reason = Some(reason);
        true
    }
}

/// Refresh token record stored by the token store.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub chain_id: String,
    pub subject_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set when the token has been exchanged for a new pair.
    pub consumed_at: Option<DateTime<Utc>>,
}

/// Anti-forgery state parked between `/auth/github` and the callback.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub state: String,
    /// Opaque browser session the state was handed to.
    pub client_session: String,
    /// Frontend path to land on after login.
    pub redirect_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(PENDING_AUTHORIZATION_TTL_SECS)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Local account linked to a provider identity.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub provider_user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    /// Provider access token, AES-256-GCM encrypted (see [`crate::secrets`]).
    pub encrypted_provider_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
