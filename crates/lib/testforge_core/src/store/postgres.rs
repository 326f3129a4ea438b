//! PostgreSQL stores.
//!
//! IDs are UUID columns bound as text (`$1::uuid`) and read back as
//! `id::text`. Jobs are stored as a JSONB document alongside the columns
//! used for lookup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use super::{AccountStore, JobStore, NewRefreshToken, RotateOutcome, StoreError, TokenStore};
use crate::models::auth::{
    Account, PendingAuthorization, RefreshTokenRecord, RevocationReason, TokenChain,
};
use crate::models::job::GenerationJob;
use crate::models::provider::ProviderIdentity;

/// Run all embedded database migrations against the given pool.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

type ChainRow = (
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<String>,
);

type RefreshRow = (
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn chain_from_row(row: ChainRow) -> TokenChain {
    let (id, subject_id, created_at, revoked_at, reason) = row;
    TokenChain {
        id,
        subject_id,
        created_at,
        revoked_at,
        revocation_reason: reason.as_deref().and_then(RevocationReason::parse),
    }
}

fn refresh_from_row(row: RefreshRow) -> RefreshTokenRecord {
    let (token_hash, chain_id, subject_id, issued_at, expires_at, consumed_at) = row;
    RefreshTokenRecord {
        token_hash,
        chain_id,
        subject_id,
        issued_at,
        expires_at,
        consumed_at,
    }
}

// =============================================================================
// Tokens
// =============================================================================

pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn create_chain(
        &self,
        chain: TokenChain,
        first: RefreshTokenRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO token_chains (id, subject_id, created_at) VALUES ($1::uuid, $2::uuid, $3)",
        )
        .bind(&chain.id)
        .bind(&chain.subject_id)
        .bind(chain.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, chain_id, subject_id, issued_at, expires_at) \
             VALUES ($1, $2::uuid, $3::uuid, $4, $5)",
        )
        .bind(&first.token_hash)
        .bind(&first.chain_id)
        .bind(&first.subject_id)
        .bind(first.issued_at)
        .bind(first.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<TokenChain>, StoreError> {
        let row = sqlx::query_as::<_, ChainRow>(
            "SELECT id::text, subject_id::text, created_at, revoked_at, revocation_reason \
             FROM token_chains WHERE id = $1::uuid",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(chain_from_row))
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, RefreshRow>(
            "SELECT token_hash, chain_id::text, subject_id::text, issued_at, expires_at, consumed_at \
             FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(refresh_from_row))
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row locks on the token and its chain serialize concurrent rotations.
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>, Option<DateTime<Utc>>, bool)>(
            "SELECT rt.chain_id::text, rt.subject_id::text, rt.expires_at, rt.consumed_at, \
                    tc.revoked_at IS NOT NULL \
             FROM refresh_tokens rt \
             JOIN token_chains tc ON tc.id = rt.chain_id \
             WHERE rt.token_hash = $1 \
             FOR UPDATE OF rt, tc",
        )
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((chain_id, subject_id, expires_at, consumed_at, chain_revoked)) = row else {
            return Ok(RotateOutcome::Unknown);
        };

        if chain_revoked {
            return Ok(RotateOutcome::ChainRevoked);
        }
        if consumed_at.is_some() {
            sqlx::query(
                "UPDATE token_chains SET revoked_at = $2, revocation_reason = $3 \
                 WHERE id = $1::uuid AND revoked_at IS NULL",
            )
            .bind(&chain_id)
            .bind(now)
            .bind(RevocationReason::RefreshReuse.as_str())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(RotateOutcome::Reused { chain_id });
        }
        if expires_at <= now {
            return Ok(RotateOutcome::Expired);
        }

        sqlx::query(
            "UPDATE refresh_tokens SET consumed_at = $2 \
             WHERE token_hash = $1 AND consumed_at IS NULL",
        )
        .bind(presented_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, chain_id, subject_id, issued_at, expires_at) \
             VALUES ($1, $2::uuid, $3::uuid, $4, $5)",
        )
        .bind(&replacement.token_hash)
        .bind(&chain_id)
        .bind(&subject_id)
        .bind(replacement.issued_at)
        .bind(replacement.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(RotateOutcome::Rotated {
            subject_id,
            chain_id,
        })
    }

    async fn revoke_chain(
        &self,
        chain_id: &str,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE token_chains SET revoked_at = $2, revocation_reason = $3 \
             WHERE id = $1::uuid AND revoked_at IS NULL",
        )
        .bind(chain_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM token_chains WHERE id = $1::uuid)",
        )
        .bind(chain_id)
        .fetch_one(&self.pool)
        .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::Missing(format!("token chain {chain_id}")))
        }
    }

    async fn put_pending(&self, pending: PendingAuthorization) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pending_authorizations (state, client_session, redirect_path, created_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (state) DO UPDATE SET client_session = EXCLUDED.client_session, \
                 redirect_path = EXCLUDED.redirect_path, created_at = EXCLUDED.created_at",
        )
        .bind(&pending.state)
        .bind(&pending.client_session)
        .bind(&pending.redirect_path)
        .bind(pending.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, Option<String>, DateTime<Utc>)>(
            "DELETE FROM pending_authorizations WHERE state = $1 \
             RETURNING state, client_session, redirect_path, created_at",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(state, client_session, redirect_path, created_at)| PendingAuthorization {
                state,
                client_session,
                redirect_path,
                created_at,
            },
        ))
    }

    async fn clear_pending_for_session(&self, client_session: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM pending_authorizations WHERE client_session = $1")
            .bind(client_session)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn evict_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff =
            now - chrono::Duration::seconds(crate::models::auth::PENDING_AUTHORIZATION_TTL_SECS);
        let result = sqlx::query("DELETE FROM pending_authorizations WHERE created_at <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Accounts
// =============================================================================

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type AccountRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

const ACCOUNT_COLUMNS: &str = "id::text, provider_user_id, username, display_name, email, \
                               avatar_url, encrypted_provider_token, created_at, updated_at";

fn account_from_row(row: AccountRow) -> Account {
    let (
        id,
        provider_user_id,
        username,
        display_name,
        email,
        avatar_url,
        encrypted_provider_token,
        created_at,
        updated_at,
    ) = row;
    Account {
        id,
        provider_user_id,
        username,
        display_name,
        email,
        avatar_url,
        encrypted_provider_token,
        created_at,
        updated_at,
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn upsert_from_provider(
        &self,
        identity: &ProviderIdentity,
        encrypted_provider_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let sql = format!(
            "INSERT INTO accounts (id, provider_user_id, username, display_name, email, avatar_url, \
                                   encrypted_provider_token, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
             ON CONFLICT (provider_user_id) DO UPDATE SET \
                 username = EXCLUDED.username, \
                 display_name = EXCLUDED.display_name, \
                 email = EXCLUDED.email, \
                 avatar_url = EXCLUDED.avatar_url, \
                 encrypted_provider_token = EXCLUDED.encrypted_provider_token, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&identity.id)
            .bind(&identity.login)
            .bind(&identity.name)
            .bind(&identity.email)
            .bind(&identity.avatar_url)
            .bind(encrypted_provider_token)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(account_from_row(row))
    }

    async fn get(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1::uuid");
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(account_from_row))
    }
}

// =============================================================================
// Jobs
// =============================================================================

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &GenerationJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO generation_jobs (id, subject_id, state, body, created_at, updated_at) \
             VALUES ($1, $2::uuid, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
        )
        .bind(job.id)
        .bind(&job.subject_id)
        .bind(job.state.as_str())
        .bind(Json(job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
        let row = sqlx::query_scalar::<_, Json<GenerationJob>>(
            "SELECT body FROM generation_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(job)| job))
    }

    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET state = $2, body = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(Json(job))
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<GenerationJob>, StoreError> {
        let rows = sqlx::query_scalar::<_, Json<GenerationJob>>(
            "SELECT body FROM generation_jobs WHERE subject_id = $1::uuid \
             ORDER BY created_at DESC, id DESC",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(job)| job).collect())
    }
}
