//! Login sessions: OAuth handshake, token issuance, rotation, revocation.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AuthError;
use super::jwt::{
    DEFAULT_ACCESS_TOKEN_TTL_SECS, generate_access_token, verify_access_token,
    verify_signature_only,
};
use super::tokens::{generate_refresh_token, generate_state, hash_token};
use crate::models::auth::{
    Account, PendingAuthorization, RefreshTokenRecord, RevocationReason, TokenChain, TokenPair,
};
use crate::provider::{ProviderCredential, ProviderError, ProviderOAuthClient};
use crate::secrets::TokenCipher;
use crate::store::{AccountStore, NewRefreshToken, RotateOutcome, StoreError, TokenStore};

/// Default refresh token lifetime: 30 days.
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Token lifetimes and key material.
#[derive(Clone)]
pub struct SessionConfig {
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Passphrase for sealing provider tokens at rest.
    pub token_encryption_key: String,
}

impl SessionConfig {
    pub fn new(jwt_secret: impl Into<String>, token_encryption_key: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            access_token_ttl: Duration::seconds(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_token_ttl: Duration::seconds(DEFAULT_REFRESH_TOKEN_TTL_SECS),
            token_encryption_key: token_encryption_key.into(),
        }
    }
}

/// Outcome of a completed OAuth callback.
#[derive(Debug)]
pub struct CompletedAuthorization {
    pub pair: TokenPair,
    pub account: Account,
    /// Frontend path requested when the login began.
    pub redirect_path: Option<String>,
}

/// Owns the token lifecycle. Handlers never touch the token store directly.
pub struct AuthSessionManager {
    config: SessionConfig,
    cipher: TokenCipher,
    tokens: Arc<dyn TokenStore>,
    accounts: Arc<dyn AccountStore>,
    provider: Arc<dyn ProviderOAuthClient>,
}

/// Relative in-app paths only: `/x`, never `//host`, `/\host` or `scheme:`.
fn validate_redirect_path(path: &str) -> Result<(), AuthError> {
    let ok = path.starts_with('/')
        && !path.starts_with("//")
        && !path.starts_with("/\\")
        && !path.contains("://")
        && !path.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(AuthError::ValidationError(format!(
            "redirect must be a relative path, got '{path}'"
        )))
    }
}

impl AuthSessionManager {
    pub fn new(
        config: SessionConfig,
        tokens: Arc<dyn TokenStore>,
        accounts: Arc<dyn AccountStore>,
        provider: Arc<dyn ProviderOAuthClient>,
    ) -> Self {
        let cipher = TokenCipher::from_passphrase(&config.token_encryption_key);
        Self {
            config,
            cipher,
            tokens,
            accounts,
            provider,
        }
    }

    /// Start an OAuth login for `client_session`, returning the provider URL.
    pub async fn begin_authorization(
        &self,
        client_session: &str,
        redirect_path: Option<&str>,
    ) -> Result<String, AuthError> {
        let redirect_path = redirect_path.filter(|p| !p.is_empty());
        if let Some(path) = redirect_path {
            validate_redirect_path(path)?;
        }
        if client_session.is_empty() {
            return Err(AuthError::ValidationError("client session is required".into()));
        }

        let state = generate_state();
        let url = self.provider.authorize_url(&state).map_err(|e| match e {
            ProviderError::NotConfigured(msg) => AuthError::Configuration(msg),
            other => AuthError::UpstreamAuth(other.to_string()),
        })?;

        self.tokens
            .put_pending(PendingAuthorization {
                state,
                client_session: client_session.to_string(),
                redirect_path: redirect_path.map(str::to_string),
                created_at: Utc::now(),
            })
            .await?;
        debug!("authorization started");
        Ok(url)
    }

    /// Finish an OAuth login: check `state`, exchange `code`, issue tokens.
    ///
    /// The pending state is consumed whatever the outcome. When
    /// `client_session` is presented it must be the session the state was
    /// issued to.
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
        client_session: Option<&str>,
    ) -> Result<CompletedAuthorization, AuthError> {
        if state.is_empty() {
            return Err(AuthError::InvalidState("missing state".into()));
        }
        let now = Utc::now();
        let pending = self
            .tokens
            .take_pending(state)
            .await?
            .ok_or_else(|| AuthError::InvalidState("unknown state".into()))?;
        if pending.is_expired(now) {
            return Err(AuthError::InvalidState("state expired".into()));
        }
        if let Some(presented) = client_session
            && presented != pending.client_session
        {
            warn!("OAuth state presented by a different client session");
            return Err(AuthError::InvalidState(
                "state was issued to another session".into(),
            ));
        }
        let cleared = self
            .tokens
            .clear_pending_for_session(&pending.client_session)
            .await?;
        if cleared > 0 {
            debug!(cleared, "dropped sibling pending authorizations");
        }

        if code.is_empty() {
            return Err(AuthError::ValidationError("missing authorization code".into()));
        }
        let grant = self.provider.exchange_code(code).await.map_err(|e| match e {
            ProviderError::NotConfigured(msg) => AuthError::Configuration(msg),
            other => AuthError::UpstreamAuth(other.to_string()),
        })?;

        let sealed = self
            .cipher
            .seal(&grant.credential.access_token, &grant.identity.id)?;
        let account = self
            .accounts
            .upsert_from_provider(&grant.identity, &sealed, now)
            .await?;

        let pair = self.start_chain(&account.id).await?;
        info!(account_id = %account.id, login = %account.username, "login completed");
        Ok(CompletedAuthorization {
            pair,
            account,
            redirect_path: pending.redirect_path,
        })
    }

    /// Create a new chain with its first token pair.
    async fn start_chain(&self, subject_id: &str) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let chain_id = Uuid::now_v7().to_string();
        let refresh_token = generate_refresh_token();
        let refresh_expires_at = now + self.config.refresh_token_ttl;

        self.tokens
            .create_chain(
                TokenChain {
                    id: chain_id.clone(),
                    subject_id: subject_id.to_string(),
                    created_at: now,
                    revoked_at: None,
                    revocation_reason: None,
                },
                RefreshTokenRecord {
                    token_hash: hash_token(&refresh_token),
                    chain_id: chain_id.clone(),
                    subject_id: subject_id.to_string(),
                    issued_at: now,
                    expires_at: refresh_expires_at,
                    consumed_at: None,
                },
            )
            .await?;

        self.mint_pair(subject_id, &chain_id, refresh_token, refresh_expires_at)
    }

    fn mint_pair(
        &self,
        subject_id: &str,
        chain_id: &str,
        refresh_token: String,
        refresh_expires_at: chrono::DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let issued_at = Utc::now();
        let (access_token, access_expires_at) = generate_access_token(
            subject_id,
            chain_id,
            issued_at,
            self.config.access_token_ttl,
            self.config.jwt_secret.as_bytes(),
        )?;
        Ok(TokenPair {
            subject_id: subject_id.to_string(),
            chain_id: chain_id.to_string(),
            access_token,
            refresh_token,
            issued_at,
            access_expires_at,
            refresh_expires_at,
            revoked: false,
        })
    }

    /// Resolve an access token to its subject. Local checks only.
    pub async fn validate_access_token(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated("missing access token".into()));
        }
        let claims = verify_access_token(token, self.config.jwt_secret.as_bytes())
            .ok_or_else(|| AuthError::Unauthenticated("invalid or expired token".into()))?;
        let chain = self
            .tokens
            .get_chain(&claims.sid)
            .await?
            .ok_or_else(|| AuthError::Unauthenticated("unknown session".into()))?;
        if chain.is_revoked() || chain.subject_id != claims.sub {
            return Err(AuthError::Unauthenticated("session revoked".into()));
        }
        Ok(claims.sub)
    }

    /// Exchange a refresh token for a new pair on the same chain.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::Unauthenticated("missing refresh token".into()));
        }
        let now = Utc::now();
        let replacement = generate_refresh_token();
        let refresh_expires_at = now + self.config.refresh_token_ttl;

        let outcome = self
            .tokens
            .rotate_refresh_token(
                &hash_token(refresh_token),
                NewRefreshToken {
                    token_hash: hash_token(&replacement),
                    issued_at: now,
                    expires_at: refresh_expires_at,
                },
                now,
            )
            .await?;

        match outcome {
            RotateOutcome::Rotated {
                subject_id,
                chain_id,
            } => {
                debug!(chain_id = %chain_id, "refresh token rotated");
                self.mint_pair(&subject_id, &chain_id, replacement, refresh_expires_at)
            }
            RotateOutcome::Unknown => Err(AuthError::Unauthenticated(
                "unknown refresh token".into(),
            )),
            RotateOutcome::Expired => Err(AuthError::Unauthenticated(
                "refresh token expired".into(),
            )),
            RotateOutcome::ChainRevoked => {
                Err(AuthError::Unauthenticated("session revoked".into()))
            }
            RotateOutcome::Reused { chain_id } => {
                warn!(chain_id = %chain_id, "refresh token reuse detected, session revoked");
                Err(AuthError::Unauthenticated(
                    "refresh token already used".into(),
                ))
            }
        }
    }

    /// Revoke the chain behind `access_token`. Expired tokens are accepted
    /// and an already-revoked chain is not an error.
    pub async fn logout(&self, access_token: &str) -> Result<(), AuthError> {
        let claims = verify_signature_only(access_token, self.config.jwt_secret.as_bytes())
            .ok_or_else(|| AuthError::Unauthenticated("invalid token".into()))?;
        match self
            .tokens
            .revoke_chain(&claims.sid, RevocationReason::Logout, Utc::now())
            .await
        {
            Ok(true) => {
                info!(account_id = %claims.sub, "logged out");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(StoreError::Missing(_)) => {
                Err(AuthError::Unauthenticated("unknown session".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn current_account(&self, subject_id: &str) -> Result<Account, AuthError> {
        self.accounts
            .get(subject_id)
            .await?
            .ok_or_else(|| AuthError::Unauthenticated("account no longer exists".into()))
    }

    /// Decrypted provider credential for provider calls on the subject's behalf.
    pub async fn provider_credential(
        &self,
        subject_id: &str,
    ) -> Result<ProviderCredential, AuthError> {
        let account = self.current_account(subject_id).await?;
        let token = self
            .cipher
            .open(&account.encrypted_provider_token, &account.provider_user_id)?;
        Ok(ProviderCredential::new(token))
    }

    /// Drop expired pending authorizations.
    pub async fn evict_expired_pending(&self) -> Result<u64, AuthError> {
        Ok(self.tokens.evict_expired_pending(Utc::now()).await?)
    }

    /// Evict expired pending authorizations every `every` until aborted.
    pub fn spawn_pending_cleanup(self: Arc<Self>, every: StdDuration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.evict_expired_pending().await {
                    Ok(0) => {}
                    Ok(n) => debug!(evicted = n, "expired pending authorizations evicted"),
                    Err(e) => warn!(error = %e, "pending authorization cleanup failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::ProviderIdentity;
    use crate::store::memory::{InMemoryAccountStore, InMemoryTokenStore};
    use crate::testing::FakeProvider;

    struct Harness {
        manager: AuthSessionManager,
        tokens: Arc<InMemoryTokenStore>,
        provider: Arc<FakeProvider>,
    }

    fn identity() -> ProviderIdentity {
        ProviderIdentity {
            id: "1001".into(),
            login: "octocat".into(),
            name: Some("Mona".into()),
            email: Some("mona@example.com".into()),
            avatar_url: None,
        }
    }

    fn harness() -> Harness {
        let tokens = Arc::new(InMemoryTokenStore::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_grant("good-code", "gho_token", identity());
        let manager = AuthSessionManager::new(
            SessionConfig::new("jwt-secret", "enc-key"),
            tokens.clone(),
            Arc::new(InMemoryAccountStore::new()),
            provider.clone(),
        );
        Harness {
            manager,
            tokens,
            provider,
        }
    }

    fn state_of(url: &str) -> String {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    async fn login(h: &Harness) -> CompletedAuthorization {
        let url = h.manager.begin_authorization("cs-1", None).await.unwrap();
        h.manager
            .complete_authorization("good-code", &state_of(&url), Some("cs-1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completed_authorization_validates_to_subject() {
        let h = harness();
        let done = login(&h).await;
        let subject = h
            .manager
            .validate_access_token(&done.pair.access_token)
            .await
            .unwrap();
        assert_eq!(subject, done.account.id);
        assert_eq!(done.pair.subject_id, done.account.id);
        assert_eq!(done.pair.expires_in(), DEFAULT_ACCESS_TOKEN_TTL_SECS);

        let cred = h.manager.provider_credential(&subject).await.unwrap();
        assert_eq!(cred.access_token, "gho_token");
    }

    #[tokio::test]
    async fn completing_clears_sibling_states() {
        let h = harness();
        let first = h.manager.begin_authorization("cs-1", None).await.unwrap();
        let second = h.manager.begin_authorization("cs-1", None).await.unwrap();
        h.manager.begin_authorization("cs-2", None).await.unwrap();
        assert_eq!(h.tokens.pending_len(), 3);

        h.manager
            .complete_authorization("good-code", &state_of(&second), Some("cs-1"))
            .await
            .unwrap();
        assert_eq!(h.tokens.pending_len(), 1);

        let err = h
            .manager
            .complete_authorization("good-code", &state_of(&first), Some("cs-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
    }

    #[tokio::test]
    async fn state_from_another_session_is_rejected() {
        let h = harness();
        let url = h.manager.begin_authorization("cs-1", None).await.unwrap();
        let err = h
            .manager
            .complete_authorization("good-code", &state_of(&url), Some("cs-other"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
        assert_eq!(h.provider.call_count("exchange_code"), 0);
    }

    #[tokio::test]
    async fn unknown_state_is_rejected_without_exchange() {
        let h = harness();
        let err = h
            .manager
            .complete_authorization("good-code", "forged", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
        assert_eq!(h.provider.call_count("exchange_code"), 0);
    }

    #[tokio::test]
    async fn expired_state_is_rejected() {
        let h = harness();
        h.tokens
            .put_pending(PendingAuthorization {
                state: "old".into(),
                client_session: "cs-1".into(),
                redirect_path: None,
                created_at: Utc::now() - Duration::minutes(11),
            })
            .await
            .unwrap();
        let err = h
            .manager
            .complete_authorization("good-code", "old", Some("cs-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState(_)));
    }

    #[tokio::test]
    async fn provider_rejection_is_upstream_auth_error() {
        let h = harness();
        let url = h.manager.begin_authorization("cs-1", None).await.unwrap();
        let err = h
            .manager
            .complete_authorization("bad-code", &state_of(&url), Some("cs-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UpstreamAuth(_)));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_configuration_error() {
        let h = harness();
        h.provider.set_unconfigured();
        let err = h
            .manager
            .begin_authorization("cs-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
        assert_eq!(h.tokens.pending_len(), 0);
    }

    #[tokio::test]
    async fn absolute_redirects_are_rejected() {
        let h = harness();
        for bad in ["https://evil.example", "//evil.example", "/\\evil", "dashboard"] {
            let err = h
                .manager
                .begin_authorization("cs-1", Some(bad))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::ValidationError(_)), "{bad}");
        }
        let url = h
            .manager
            .begin_authorization("cs-1", Some("/repos?tab=1"))
            .await
            .unwrap();
        let done = h
            .manager
            .complete_authorization("good-code", &state_of(&url), Some("cs-1"))
            .await
            .unwrap();
        assert_eq!(done.redirect_path.as_deref(), Some("/repos?tab=1"));
    }

    #[tokio::test]
    async fn refresh_rotates_once_and_reuse_revokes_chain() {
        let h = harness();
        let done = login(&h).await;

        let rotated = h.manager.refresh(&done.pair.refresh_token).await.unwrap();
        assert_eq!(rotated.chain_id, done.pair.chain_id);
        assert_ne!(rotated.refresh_token, done.pair.refresh_token);
        h.manager
            .validate_access_token(&rotated.access_token)
            .await
            .unwrap();

        let err = h.manager.refresh(&done.pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));

        // Every token of the chain is dead now.
        for token in [&done.pair.access_token, &rotated.access_token] {
            assert!(h.manager.validate_access_token(token).await.is_err());
        }
        assert!(h.manager.refresh(&rotated.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_refresh_has_single_winner() {
        let h = Arc::new(harness());
        let done = login(&h).await;
        let (a, b) = tokio::join!(
            h.manager.refresh(&done.pair.refresh_token),
            h.manager.refresh(&done.pair.refresh_token)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let chain = h.tokens.get_chain(&done.pair.chain_id).await.unwrap().unwrap();
        assert!(chain.is_revoked());
    }

    #[tokio::test]
    async fn expired_refresh_token_leaves_store_untouched() {
        let tokens = Arc::new(InMemoryTokenStore::new());
        let provider = Arc::new(FakeProvider::new());
        provider.add_grant("good-code", "gho_token", identity());
        let mut config = SessionConfig::new("jwt-secret", "enc-key");
        config.refresh_token_ttl = Duration::seconds(-1);
        let manager = AuthSessionManager::new(
            config,
            tokens.clone(),
            Arc::new(InMemoryAccountStore::new()),
            provider,
        );
        let url = manager.begin_authorization("cs", None).await.unwrap();
        let done = manager
            .complete_authorization("good-code", &state_of(&url), Some("cs"))
            .await
            .unwrap();

        let err = manager.refresh(&done.pair.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
        let record = tokens
            .find_refresh_token(&hash_token(&done.pair.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert!(record.consumed_at.is_none());
        let chain = tokens.get_chain(&done.pair.chain_id).await.unwrap().unwrap();
        assert!(!chain.is_revoked());
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let h = harness();
        let done = login(&h).await;
        h.manager.logout(&done.pair.access_token).await.unwrap();
        h.manager.logout(&done.pair.access_token).await.unwrap();
        assert!(
            h.manager
                .validate_access_token(&done.pair.access_token)
                .await
                .is_err()
        );
        let chain = h.tokens.get_chain(&done.pair.chain_id).await.unwrap().unwrap();
        assert_eq!(chain.revocation_reason, Some(RevocationReason::Logout));
        assert!(h.manager.refresh(&done.pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn logout_accepts_expired_access_token() {
        let h = harness();
        let done = login(&h).await;
        let (expired, _) = generate_access_token(
            &done.pair.subject_id,
            &done.pair.chain_id,
            Utc::now() - Duration::hours(2),
            Duration::hours(1),
            b"jwt-secret",
        )
        .unwrap();
        h.manager.logout(&expired).await.unwrap();
        assert!(h.manager.refresh(&done.pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn logout_rejects_forged_token() {
        let h = harness();
        let err = h.manager.logout("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)));
    }
}
