//! In-memory stores backed by `DashMap`.
//!
//! Per-entity atomicity comes from DashMap's entry locks: a token chain and
//! all of its refresh tokens live in one map entry, so rotation runs under
//! that entry's exclusive lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{AccountStore, JobStore, NewRefreshToken, RotateOutcome, StoreError, TokenStore};
use crate::models::auth::{
    Account, PendingAuthorization, RefreshTokenRecord, RevocationReason, TokenChain,
};
use crate::models::job::GenerationJob;
use crate::models::provider::ProviderIdentity;

// =============================================================================
// Tokens
// =============================================================================

struct ChainEntry {
    chain: TokenChain,
    tokens: HashMap<String, RefreshTokenRecord>,
}

/// In-memory token store.
pub struct InMemoryTokenStore {
    chains: DashMap<String, ChainEntry>,
    /// refresh token hash → chain ID
    token_index: DashMap<String, String>,
    /// OAuth state → pending authorization
    pending: DashMap<String, PendingAuthorization>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            token_index: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Number of pending authorizations (for diagnostics and tests).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn create_chain(
        &self,
        chain: TokenChain,
        first: RefreshTokenRecord,
    ) -> Result<(), StoreError> {
        if self.chains.contains_key(&chain.id) {
            return Err(StoreError::Duplicate(format!("token chain {}", chain.id)));
        }
        let chain_id = chain.id.clone();
        let hash = first.token_hash.clone();
        let mut tokens = HashMap::new();
        tokens.insert(hash.clone(), first);
        self.chains
            .insert(chain_id.clone(), ChainEntry { chain, tokens });
        self.token_index.insert(hash, chain_id);
        Ok(())
    }

    async fn get_chain(&self, chain_id: &str) -> Result<Option<TokenChain>, StoreError> {
        Ok(self.chains.get(chain_id).map(|e| e.chain.clone()))
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let Some(chain_id) = self.token_index.get(token_hash).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self
            .chains
            .get(&chain_id)
            .and_then(|e| e.tokens.get(token_hash).cloned()))
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let Some(chain_id) = self
            .token_index
            .get(presented_hash)
            .map(|e| e.value().clone())
        else {
            return Ok(RotateOutcome::Unknown);
        };

        // Exclusive lock on the chain for the whole compare-and-consume.
        let Some(mut entry) = self.chains.get_mut(&chain_id) else {
            return Ok(RotateOutcome::Unknown);
        };
        let entry = &mut *entry;

        if entry.chain.is_revoked() {
            return Ok(RotateOutcome::ChainRevoked);
        }
        let Some(record) = entry.tokens.get_mut(presented_hash) else {
            return Ok(RotateOutcome::Unknown);
        };
        if record.consumed_at.is_some() {
            entry.chain.revoke(RevocationReason::RefreshReuse, now);
            return Ok(RotateOutcome::Reused { chain_id });
        }
        if record.expires_at <= now {
            return Ok(RotateOutcome::Expired);
        }

        record.consumed_at = Some(now);
        let subject_id = entry.chain.subject_id.clone();
        let new_hash = replacement.token_hash.clone();
        entry.tokens.insert(
            new_hash.clone(),
            RefreshTokenRecord {
                token_hash: replacement.token_hash,
                chain_id: chain_id.clone(),
                subject_id: subject_id.clone(),
                issued_at: replacement.issued_at,
                expires_at: replacement.expires_at,
                consumed_at: None,
            },
        );
        // The replacement has not been handed out yet, so indexing it after
        // the chain entry is updated cannot be observed by another caller.
        self.token_index.insert(new_hash, chain_id.clone());

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
        match self.chains.get_mut(chain_id) {
            Some(mut entry) => Ok(entry.chain.revoke(reason, now)),
            None => Err(StoreError::Missing(format!("token chain {chain_id}"))),
        }
    }

    async fn put_pending(&self, pending: PendingAuthorization) -> Result<(), StoreError> {
        self.pending.insert(pending.state.clone(), pending);
        Ok(())
    }

    async fn take_pending(&self, state: &str) -> Result<Option<PendingAuthorization>, StoreError> {
        Ok(self.pending.remove(state).map(|(_, v)| v))
    }

    async fn clear_pending_for_session(&self, client_session: &str) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.pending.retain(|_, p| {
            let keep = p.client_session != client_session;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn evict_expired_pending(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        self.pending.retain(|_, p| {
            let keep = !p.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// In-memory account store.
pub struct InMemoryAccountStore {
    accounts: DashMap<String, Account>,
    /// provider user ID → account ID
    by_provider: DashMap<String, String>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            by_provider: DashMap::new(),
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn upsert_from_provider(
        &self,
        identity: &ProviderIdentity,
        encrypted_provider_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let account_id = self
            .by_provider
            .entry(identity.id.clone())
            .or_insert_with(|| Uuid::now_v7().to_string())
            .clone();

        let mut account = self
            .accounts
            .entry(account_id.clone())
            .or_insert_with(|| Account {
                id: account_id,
                provider_user_id: identity.id.clone(),
                username: identity.login.clone(),
                display_name: None,
                email: None,
                avatar_url: None,
                encrypted_provider_token: String::new(),
                created_at: now,
                updated_at: now,
            });
        account.username = identity.login.clone();
        account.display_name = identity.name.clone();
        account.email = identity.email.clone();
        account.avatar_url = identity.avatar_url.clone();
        account.encrypted_provider_token = encrypted_provider_token.to_string();
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn get(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(account_id).map(|a| a.clone()))
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// In-memory generation job store.
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, GenerationJob>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &GenerationJob) -> Result<(), StoreError> {
        match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(format!("job {}", job.id))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("job {}", job.id))),
        }
    }

    async fn list_for_subject(&self, subject_id: &str) -> Result<Vec<GenerationJob>, StoreError> {
        let mut jobs: Vec<GenerationJob> = self
            .jobs
            .iter()
            .filter(|j| j.subject_id == subject_id)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::models::provider::RepoId;

    fn chain(id: &str) -> TokenChain {
        TokenChain {
            id: id.into(),
            subject_id: "subject".into(),
            created_at: Utc::now(),
            revoked_at: None,
            revocation_reason: None,
        }
    }

    fn record(hash: &str, chain_id: &str, expires_at: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token_hash: hash.into(),
            chain_id: chain_id.into(),
            subject_id: "subject".into(),
            issued_at: Utc::now(),
            expires_at,
            consumed_at: None,
        }
    }

    fn replacement(hash: &str) -> NewRefreshToken {
        NewRefreshToken {
            token_hash: hash.into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(30),
        }
    }

    async fn seeded() -> InMemoryTokenStore {
        let store = InMemoryTokenStore::new();
        store
            .create_chain(chain("c1"), record("h1", "c1", Utc::now() + Duration::days(1)))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn rotation_consumes_and_links_replacement() {
        let store = seeded().await;
        let outcome = store
            .rotate_refresh_token("h1", replacement("h2"), Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RotateOutcome::Rotated {
                subject_id: "subject".into(),
                chain_id: "c1".into()
            }
        );
        let old = store.find_refresh_token("h1").await.unwrap().unwrap();
        assert!(old.consumed_at.is_some());
        let new = store.find_refresh_token("h2").await.unwrap().unwrap();
        assert_eq!(new.chain_id, "c1");
        assert!(new.consumed_at.is_none());
    }

    #[tokio::test]
    async fn reuse_revokes_chain() {
        let store = seeded().await;
        store
            .rotate_refresh_token("h1", replacement("h2"), Utc::now())
            .await
            .unwrap();
        let outcome = store
            .rotate_refresh_token("h1", replacement("h3"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Reused { chain_id: "c1".into() });
        assert!(store.get_chain("c1").await.unwrap().unwrap().is_revoked());

        // The live token of the chain is dead too.
        let outcome = store
            .rotate_refresh_token("h2", replacement("h4"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::ChainRevoked);
        assert!(store.find_refresh_token("h3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_token_is_left_untouched() {
        let store = InMemoryTokenStore::new();
        store
            .create_chain(chain("c1"), record("h1", "c1", Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        let outcome = store
            .rotate_refresh_token("h1", replacement("h2"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Expired);
        assert!(
            store
                .find_refresh_token("h1")
                .await
                .unwrap()
                .unwrap()
                .consumed_at
                .is_none()
        );
        assert!(store.find_refresh_token("h2").await.unwrap().is_none());
        assert!(!store.get_chain("c1").await.unwrap().unwrap().is_revoked());
    }

    #[tokio::test]
    async fn concurrent_rotation_has_one_winner() {
        let store = Arc::new(seeded().await);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .rotate_refresh_token("h1", replacement(&format!("n{i}")), Utc::now())
                    .await
                    .unwrap()
            }));
        }
        let mut rotated = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RotateOutcome::Rotated { .. }) {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);
        assert!(store.get_chain("c1").await.unwrap().unwrap().is_revoked());
    }

    #[tokio::test]
    async fn pending_state_is_single_use_and_session_scoped() {
        let store = InMemoryTokenStore::new();
        for (state, session) in [("s1", "a"), ("s2", "a"), ("s3", "b")] {
            store
                .put_pending(PendingAuthorization {
                    state: state.into(),
                    client_session: session.into(),
                    redirect_path: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert!(store.take_pending("s1").await.unwrap().is_some());
        assert!(store.take_pending("s1").await.unwrap().is_none());
        assert_eq!(store.clear_pending_for_session("a").await.unwrap(), 1);
        assert_eq!(store.pending_len(), 1);
    }

    #[tokio::test]
    async fn evicts_only_expired_pending() {
        let store = InMemoryTokenStore::new();
        for (state, age) in [("fresh", 1), ("stale", 11)] {
            store
                .put_pending(PendingAuthorization {
                    state: state.into(),
                    client_session: "cs".into(),
                    redirect_path: None,
                    created_at: Utc::now() - Duration::minutes(age),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.evict_expired_pending(Utc::now()).await.unwrap(), 1);
        assert!(store.take_pending("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn account_upsert_keeps_id_and_refreshes_profile() {
        let store = InMemoryAccountStore::new();
        let mut identity = ProviderIdentity {
            id: "42".into(),
            login: "octocat".into(),
            name: None,
            email: None,
            avatar_url: None,
        };
        let first = store
            .upsert_from_provider(&identity, "enc-1", Utc::now())
            .await
            .unwrap();
        identity.login = "octocat-renamed".into();
        identity.email = Some("octo@example.com".into());
        let second = store
            .upsert_from_provider(&identity, "enc-2", Utc::now())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username, "octocat-renamed");
        assert_eq!(second.encrypted_provider_token, "enc-2");
        assert_eq!(
            store.get(&first.id).await.unwrap().unwrap().email.as_deref(),
            Some("octo@example.com")
        );
    }

    #[tokio::test]
    async fn jobs_list_newest_first_per_subject() {
        let store = InMemoryJobStore::new();
        let mut older = GenerationJob::new("alice", RepoId::new("o", "r"), vec!["a.py".into()]);
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = GenerationJob::new("alice", RepoId::new("o", "r"), vec!["b.py".into()]);
        let other = GenerationJob::new("bob", RepoId::new("o", "r"), vec!["c.py".into()]);
        for job in [&older, &newer, &other] {
            store.insert(job).await.unwrap();
        }
        assert!(store.insert(&older).await.is_err());

        let listed = store.list_for_subject("alice").await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn updating_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        let job = GenerationJob::new("alice", RepoId::new("o", "r"), vec!["a.py".into()]);
        assert!(matches!(
            store.update(&job).await,
            Err(StoreError::Missing(_))
        ));
    }
}
