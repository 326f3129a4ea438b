//! API server configuration.

use std::time::Duration;

use testforge_core::auth::SessionConfig;
use testforge_core::auth::jwt::resolve_jwt_secret;
use testforge_core::provider::github::GithubConfig;
use testforge_core::workflow::OrchestratorConfig;
use tracing::warn;

const DEV_TOKEN_ENCRYPTION_KEY: &str = "testforge-default-dev-key-change-in-production";

/// Configuration for the API server.
#[derive(Clone)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL. `None` runs on in-memory stores.
    pub database_url: Option<String>,
    /// JWT signing secret.
    pub jwt_secret: String,
    /// Passphrase for encrypting provider tokens at rest.
    pub token_encryption_key: String,
    /// Browser app that receives post-login redirects.
    pub frontend_url: String,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,
    pub github_redirect_uri: String,
    pub github_api_url: String,
    /// External generation service; the template engine is used when unset.
    pub generation_engine_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub provider_timeout: Duration,
    pub generation_timeout: Duration,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = match env_opt(name).map(|v| v.parse::<u64>()) {
        Some(Ok(secs)) if secs > 0 => secs,
        Some(_) => {
            warn!(var = name, default, "ignoring invalid duration");
            default
        }
        None => default,
    };
    Duration::from_secs(secs)
}

impl ApiConfig {
    /// Defaults for everything except the two secrets.
    pub fn new(jwt_secret: impl Into<String>, token_encryption_key: impl Into<String>) -> Self {
        Self {
            bind_addr: "127.0.0.1:3100".into(),
            database_url: None,
            jwt_secret: jwt_secret.into(),
            token_encryption_key: token_encryption_key.into(),
            frontend_url: "http://localhost:5173".into(),
            github_client_id: None,
            github_client_secret: None,
            github_redirect_uri: "http://localhost:3100/api/v1/auth/github/callback".into(),
            github_api_url: "https://api.github.com".into(),
            generation_engine_url: None,
            generation_api_key: None,
            provider_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(120),
        }
    }

    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                   | Default                                   |
    /// |----------------------------|-------------------------------------------|
    /// | `BIND_ADDR`                | `127.0.0.1:3100`                          |
    /// | `DATABASE_URL`             | unset (in-memory stores)                  |
    /// | `JWT_SECRET` / `AUTH_SECRET` | generated & persisted to file           |
    /// | `TOKEN_ENCRYPTION_KEY`     | development key (warns)                   |
    /// | `FRONTEND_URL`             | `http://localhost:5173`                   |
    /// | `GITHUB_CLIENT_ID`         | unset (login disabled)                    |
    /// | `GITHUB_CLIENT_SECRET`     | unset (login disabled)                    |
    /// | `GITHUB_REDIRECT_URI`      | `http://localhost:3100/api/v1/auth/github/callback` |
    /// | `GITHUB_API_URL`           | `https://api.github.com`                  |
    /// | `GENERATION_ENGINE_URL`    | unset (template engine)                   |
    /// | `GENERATION_API_KEY`       | unset                                     |
    /// | `PROVIDER_TIMEOUT_SECS`    | `30`                                      |
    /// | `GENERATION_TIMEOUT_SECS`  | `120`                                     |
    pub fn from_env() -> Self {
        let token_encryption_key = env_opt("TOKEN_ENCRYPTION_KEY").unwrap_or_else(|| {
            warn!("TOKEN_ENCRYPTION_KEY not set, using the development key");
            DEV_TOKEN_ENCRYPTION_KEY.into()
        });
        let defaults = Self::new(resolve_jwt_secret(), token_encryption_key);
        Self {
            bind_addr: env_opt("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env_opt("DATABASE_URL"),
            frontend_url: env_opt("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            github_client_id: env_opt("GITHUB_CLIENT_ID"),
            github_client_secret: env_opt("GITHUB_CLIENT_SECRET"),
            github_redirect_uri: env_opt("GITHUB_REDIRECT_URI")
                .unwrap_or(defaults.github_redirect_uri),
            github_api_url: env_opt("GITHUB_API_URL").unwrap_or(defaults.github_api_url),
            generation_engine_url: env_opt("GENERATION_ENGINE_URL"),
            generation_api_key: env_opt("GENERATION_API_KEY"),
            provider_timeout: env_secs("PROVIDER_TIMEOUT_SECS", 30),
            generation_timeout: env_secs("GENERATION_TIMEOUT_SECS", 120),
            ..defaults
        }
    }

    /// Frontend base URL without a trailing slash.
    pub fn frontend_base(&self) -> &str {
        self.frontend_url.trim_end_matches('/')
    }

    /// Cookies are `Secure` whenever the frontend is served over HTTPS.
    pub fn secure_cookies(&self) -> bool {
        self.frontend_url.starts_with("https://")
    }

    pub fn github_config(&self) -> GithubConfig {
        GithubConfig {
            client_id: self.github_client_id.clone(),
            client_secret: self.github_client_secret.clone(),
            api_url: self.github_api_url.clone(),
            ..GithubConfig::new(self.github_redirect_uri.clone())
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.jwt_secret.clone(), self.token_encryption_key.clone())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            provider_timeout: self.provider_timeout,
            generation_timeout: self.generation_timeout,
            ..OrchestratorConfig::default()
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database", &self.database_url.as_ref().map(|_| "<set>"))
            .field("frontend_url", &self.frontend_url)
            .field("github_client_id", &self.github_client_id)
            .field("github_redirect_uri", &self.github_redirect_uri)
            .field("github_api_url", &self.github_api_url)
            .field("generation_engine_url", &self.generation_engine_url)
            .field("provider_timeout", &self.provider_timeout)
            .field("generation_timeout", &self.generation_timeout)
            .finish_non_exhaustive()
    }
}
