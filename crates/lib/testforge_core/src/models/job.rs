//! Generation job model.
//!
//! A job tracks one generate → review → publish workflow. Transitions are
//! validated by [`crate::workflow::state_machine`]; this module only holds data.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::provider::RepoId;

/// Workflow state of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    FetchingFiles,
    Generating,
    ReadyForReview,
    Saved,
    Publishing,
    Published,
    Failed,
    Retrying,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::FetchingFiles => "fetching_files",
            JobState::Generating => "generating",
            JobState::ReadyForReview => "ready_for_review",
            JobState::Saved => "saved",
            JobState::Publishing => "publishing",
            JobState::Published => "published",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Published)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a step failure, preserved on the job for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    Upstream,
    Timeout,
    Conflict,
    Validation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::Upstream => "upstream_error",
            FailureKind::Timeout => "timeout",
            FailureKind::Conflict => "conflict",
            FailureKind::Validation => "validation_error",
        }
    }
}

/// Why and where a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    /// State the job was in when the step failed; retry resumes here.
    pub step: JobState,
    pub kind: FailureKind,
    pub message: String,
}

/// Parameters of the publish request, kept so a retry can re-run it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub branch: String,
    pub title: String,
    pub description: String,
}

/// Reference to the pull request a job was published as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRef {
    pub branch: String,
    pub url: String,
    pub number: u64,
}

/// One generate-to-pull-request workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub id: Uuid,
    pub subject_id: String,
    pub repo: RepoId,
    /// Source paths in the order the user selected them.
    pub selected_files: Vec<String>,
    pub state: JobState,
    /// Fetched source contents, keyed by path.
    #[serde(default)]
    pub source_files: BTreeMap<String, String>,
    /// Engine output, keyed by source path.
    #[serde(default)]
    pub generated_test_cases: BTreeMap<String, String>,
    /// User edits, keyed by source path. Override `generated_test_cases`.
    #[serde(default)]
    pub edited_test_cases: BTreeMap<String, String>,
    pub publish_request: Option<PublishRequest>,
    pub pull_request: Option<PullRequestRef>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// New job in `created`.
    pub fn new(subject_id: impl Into<String>, repo: RepoId, selected_files: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            subject_id: subject_id.into(),
            repo,
            selected_files,
            state: JobState::Created,
            source_files: BTreeMap::new(),
            generated_test_cases: BTreeMap::new(),
            edited_test_cases: BTreeMap::new(),
            publish_request: None,
            pull_request: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, subject_id: &str) -> bool {
        self.subject_id == subject_id
    }

    /// Content to publish: edits win over generated content per path.
    pub fn effective_test_cases(&self) -> BTreeMap<String, String> {
        let mut effective = self.generated_test_cases.clone();
        for (path, content) in &self.edited_test_cases {
            effective.insert(path.clone(), content.clone());
        }
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> GenerationJob {
        GenerationJob::new(
            "subject",
            RepoId::new("octo", "demo"),
            vec!["a.py".into(), "b.py".into()],
        )
    }

    #[test]
    fn new_job_starts_created() {
        let job = job();
        assert_eq!(job.state, JobState::Created);
        assert!(job.failure.is_none());
        assert!(job.is_owned_by("subject"));
        assert!(!job.is_owned_by("someone-else"));
    }

    #[test]
    fn edits_override_generated_content() {
        let mut job = job();
        job.generated_test_cases
            .insert("a.py".into(), "def test_a(): pass".into());
        job.generated_test_cases
            .insert("b.py".into(), "def test_b(): pass".into());
        job.edited_test_cases
            .insert("a.py".into(), "def test_a(): assert True".into());

        let effective = job.effective_test_cases();
        assert_eq!(effective["a.py"], "def test_a(): assert True");
        assert_eq!(effective["b.py"], "def test_b(): pass");
    }

    #[test]
    fn job_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::ReadyForReview).unwrap();
        assert_eq!(json, "\"ready_for_review\"");
        assert_eq!(JobState::FetchingFiles.to_string(), "fetching_files");
    }

    #[test]
    fn job_survives_json_storage() {
        let mut job = job();
        job.failure = Some(JobFailure {
            step: JobState::Publishing,
            kind: FailureKind::Upstream,
            message: "boom".into(),
        });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["repo"], "octo/demo");
        assert_eq!(value["failure"]["step"], "publishing");
        let back: GenerationJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
