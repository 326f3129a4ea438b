//! Remote generation engine.
//!
//! POSTs the fetched sources to `{base_url}/generate` and expects a
//! `{"testCases": {"<source path>": "<test content>"}}` response.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::layout::{Language, test_path_for};
use super::{GenerationEngine, GenerationError, SourceFile, ensure_complete};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    files: Vec<GenerateFile<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateFile<'a> {
    path: &'a str,
    content: &'a str,
    language: &'static str,
    framework: &'static str,
    test_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    test_cases: BTreeMap<String, String>,
}

pub struct HttpGenerationEngine {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpGenerationEngine {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: format!("{}/generate", base_url.trim_end_matches('/')),
            api_key,
        }
    }
}

#[async_trait]
impl GenerationEngine for HttpGenerationEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn generate(
        &self,
        files: &[SourceFile],
    ) -> Result<BTreeMap<String, String>, GenerationError> {
        let body = GenerateRequest {
            files: files
                .iter()
                .map(|f| {
                    let lang = Language::from_path(&f.path);
                    GenerateFile {
                        path: &f.path,
                        content: &f.content,
                        language: lang.as_str(),
                        framework: lang.framework(),
                        test_path: test_path_for(&f.path),
                    }
                })
                .collect(),
        };

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| GenerationError::Transport(format!("{e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(GenerationError::Rejected(format!("{status} {text}")));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(format!("{e}")))?;
        ensure_complete(files, &parsed.test_cases)?;
        debug!(files = files.len(), "remote generation complete");

        // Only the requested paths are kept.
        let mut out = parsed.test_cases;
        out.retain(|path, _| files.iter().any(|f| &f.path == path));
        Ok(out)
    }
}
