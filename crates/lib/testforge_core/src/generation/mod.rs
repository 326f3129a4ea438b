//! Test generation seam.
//!
//! A [`GenerationEngine`] turns fetched source files into test file contents,
//! keyed by the source path they cover. Two engines ship:
//!
//! - [`template::TemplateGenerationEngine`]: offline, deterministic skeletons
//! - [`http::HttpGenerationEngine`]: delegates to an external generation service

pub mod http;
pub mod layout;
pub mod template;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generation errors.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Generation engine rejected the request: {0}")]
    Rejected(String),

    #[error("Generation engine unreachable: {0}")]
    Transport(String),

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid generation engine response: {0}")]
    InvalidResponse(String),

    #[error("Generation engine produced no output for: {}", .0.join(", "))]
    Incomplete(Vec<String>),
}

/// A fetched source file handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Short engine name for logs and the health endpoint.
    fn name(&self) -> &'static str;

    /// Generate test contents for `files`, keyed by source path.
    async fn generate(
        &self,
        files: &[SourceFile],
    ) -> Result<BTreeMap<String, String>, GenerationError>;
}

/// Check that `output` covers every input file.
pub fn ensure_complete(
    files: &[SourceFile],
    output: &BTreeMap<String, String>,
) -> Result<(), GenerationError> {
    let missing: Vec<String> = files
        .iter()
        .filter(|f| !output.contains_key(&f.path))
        .map(|f| f.path.clone())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GenerationError::Incomplete(missing))
    }
}
