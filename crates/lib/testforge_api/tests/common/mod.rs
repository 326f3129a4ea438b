//! Shared harness for router-level tests: in-memory stores, fake GitHub and
//! engine, and a helper that walks the OAuth dance.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Request, StatusCode};
use testforge_api::config::ApiConfig;
use testforge_api::{AppState, router};
use testforge_core::models::provider::{ProviderIdentity, RepoId};
use testforge_core::store::Stores;
use testforge_core::testing::{FakeEngine, FakeProvider};
use tower::ServiceExt;

pub const FRONTEND: &str = "http://localhost:5173";

pub struct TestApp {
    pub app: Router,
    pub provider: Arc<FakeProvider>,
    pub engine: Arc<FakeEngine>,
    pub repo: RepoId,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub json: serde_json::Value,
}

impl Reply {
    pub fn location(&self) -> &str {
        self.headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    /// `name=value` of the first Set-Cookie for `name`.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().to_string())
            .find(|pair| pair.starts_with(&format!("{name}=")))
    }
}

pub fn identity(id: &str, login: &str) -> ProviderIdentity {
    ProviderIdentity {
        id: id.into(),
        login: login.into(),
        name: Some(format!("{login} (display)")),
        email: Some(format!("{login}@example.com")),
        avatar_url: None,
    }
}

pub fn test_app() -> TestApp {
    let provider = Arc::new(FakeProvider::new());
    let engine = Arc::new(FakeEngine::new());
    provider.add_grant("alice-code", "gho_alice", identity("1001", "alice"));
    provider.add_grant("bob-code", "gho_bob", identity("1002", "bob"));

    let repo = RepoId::new("octo", "calc");
    provider.add_repo(&repo, "main");
    provider.put_file(&repo, "a.py", "def add(a, b):\n    return a + b\n");
    provider.put_file(&repo, "b.py", "def sub(a, b):\n    return a - b\n");
    provider.put_file(&repo, "pkg/util.py", "def noop():\n    pass\n");

    let mut config = ApiConfig::new("test-jwt-secret", "test-encryption-key");
    config.frontend_url = FRONTEND.into();
    let state = AppState::new(config, Stores::in_memory(), provider.clone(), engine.clone());
    TestApp {
        app: router(state),
        provider,
        engine,
        repo,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Reply {
        let resp = self.app.clone().oneshot(request).await.expect("request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("JSON body")
        };
        Reply {
            status,
            headers,
            json,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: serde_json::Value) -> Reply {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        self.send(req.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Start a login and return (state, session cookie pair).
    pub async fn begin_login(&self, redirect: Option<&str>) -> (String, String) {
        let uri = match redirect {
            Some(r) => format!("/api/v1/auth/github?redirect={r}"),
            None => "/api/v1/auth/github".to_string(),
        };
        let reply = self.get(&uri, None).await;
        assert_eq!(reply.status, StatusCode::FOUND);
        let state = url::Url::parse(reply.location())
            .expect("authorize URL")
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state in authorize URL");
        let session = reply
            .cookie("testforge_oauth_session")
            .expect("session cookie");
        (state, session)
    }

    /// Finish a login with `code`; returns the callback reply.
    pub async fn callback(&self, code: &str, state: &str, session: Option<&str>) -> Reply {
        let mut req = Request::builder()
            .uri(format!("/api/v1/auth/github/callback?code={code}&state={state}"));
        if let Some(session) = session {
            req = req.header(COOKIE, session);
        }
        self.send(req.body(Body::empty()).unwrap()).await
    }

    /// Full login; returns (access token, refresh token).
    pub async fn login(&self, code: &str) -> (String, String) {
        let (state, session) = self.begin_login(None).await;
        let reply = self.callback(code, &state, Some(&session)).await;
        assert_eq!(reply.status, StatusCode::FOUND);
        fragment_tokens(reply.location())
    }
}

/// Tokens from a login redirect's fragment.
pub fn fragment_tokens(location: &str) -> (String, String) {
    let fragment = location.split_once('#').expect("fragment").1;
    let mut access = None;
    let mut refresh = None;
    for (k, v) in url::form_urlencoded::parse(fragment.as_bytes()) {
        match k.as_ref() {
            "access_token" => access = Some(v.into_owned()),
            "refresh_token" => refresh = Some(v.into_owned()),
            _ => {}
        }
    }
    (access.expect("access_token"), refresh.expect("refresh_token"))
}
