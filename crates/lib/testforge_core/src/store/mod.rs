//! Persistence seams.
//!
//! Three stores back the service: tokens (chains, refresh tokens, pending
//! OAuth authorizations), accounts, and generation jobs. Every mutation is
//! atomic at the granularity of one entity (one chain, one account, one job).
//!
//! - [`memory`]: `dashmap`-backed, used in tests and single-process setups
//! - [`postgres`]: `sqlx` PostgreSQL, with embedded migrations

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::auth::{
    Account, PendingAuthorization, RefreshTokenRecord, RevocationReason, TokenChain,
};
use crate::models::job::GenerationJob;
use crate::models::provider::ProviderIdentity;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    Missing(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

/// Replacement refresh token minted during rotation.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a compare-and-consume on a presented refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The token was live; it is now consumed and the replacement is stored.
    Rotated { subject_id: String, chain_id: String },
    /// No such token.
    Unknown,
    /// The token is past its expiry. Nothing was mutated.
    Expired,
    /// The token's chain was already revoked. Nothing was mutated.
    ChainRevoked,
    /// The token had already been consumed; the store revoked the whole chain.
    Reused { chain_id: String },
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Create a chain together with its first refresh token.
    async fn create_chain(
        &self,
        chain: TokenChain,
        first: RefreshTokenRecord,
    ) -> Result<(), StoreError>;

    async fn get_chain(&self, chain_id: &str) -> Result<Option<TokenChain>, StoreError>;

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Atomically consume `presented_hash` and store `replacement` in the same
    /// chain. Reuse of a consumed token revokes the chain within the same
    /// critical section.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError>;

    /// Revoke a chain. Returns `false` if it was already revoked.
    async fn revoke_chain(
        &self,
        chain_id: &str,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn put_pending(&self, pending: PendingAuthorization) -> Result<(), StoreError>;

    /// Remove and return the pending authorization for `state`.
    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, StoreError>;

    /// Drop every pending authorization handed to `client_session`.
    async fn clear_pending_for_session(&self, client_session: &str) -> Result<u64, StoreError>;

    /// Drop pending authorizations that expired before `now`.
    async fn evict_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create or refresh the account linked to a provider identity.
    async fn upsert_from_provider(
        &self,
        identity: &ProviderIdentity,
        encrypted_provider_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError>;

    async fn get(&self, account_id: &str) -> Result<Option<Account>, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &GenerationJob) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError>;

    /// Overwrite an existing job. Fails with [`StoreError::Missing`] if absent.
    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError>;

    /// Jobs owned by `subject_id`, newest first.
    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<GenerationJob>, StoreError>;
}

/// The full set of stores the service runs on.
#[derive(Clone)]
pub struct Stores {
    pub tokens: Arc<dyn TokenStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub jobs: Arc<dyn JobStore>,
    /// Human-readable backend name, reported by the health endpoint.
    pub backend: &'static str,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            tokens: Arc::new(memory::InMemoryTokenStore::new()),
            accounts: Arc::new(memory::InMemoryAccountStore::new()),
            jobs: Arc::new(memory::InMemoryJobStore::new()),
            backend: "memory",
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            tokens: Arc::new(postgres::PgTokenStore::new(pool.clone())),
            accounts: Arc::new(postgres::PgAccountStore::new(pool.clone())),
            jobs: Arc::new(postgres::PgJobStore::new(pool)),
            backend: "postgres",
        }
    }
}
