//! Drives generation jobs through fetch → generate → review → publish.
//!
//! A per-job async mutex serializes read-modify-write of one job record. It is
//! never held across a provider or engine call: the persisted state
//! (`fetching_files`, `generating`, `publishing`) is the claim while the call
//! is in flight, so a concurrent save or publish sees it and is rejected.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::publisher::{DEFAULT_PR_BODY, DEFAULT_PR_TITLE, PullRequestPublisher, validate_branch_name};
use super::retry::RetryPolicy;
use super::state_machine::{resume_state, transition};
use super::WorkflowError;
use crate::generation::layout::test_path_for;
use crate::generation::{GenerationEngine, GenerationError, SourceFile, ensure_complete};
use crate::models::job::{GenerationJob, JobFailure, JobState, PublishRequest};
use crate::models::provider::{CommitFile, InvalidRepoId, RepoId};
use crate::provider::{ProviderCredential, ProviderError, ProviderOAuthClient, with_deadline};
use crate::store::JobStore;

/// Timeouts, retry policy and fan-out for pipeline steps.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fetch_retry: RetryPolicy,
    /// Deadline for each provider call.
    pub provider_timeout: Duration,
    /// Deadline for one engine call covering all files of a job.
    pub generation_timeout: Duration,
    /// Files fetched concurrently per job.
    pub fetch_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fetch_retry: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(120),
            fetch_concurrency: 4,
        }
    }
}

/// Publish options; omitted fields fall back to defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishParams {
    pub branch: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Branch used when a publish request names none.
pub fn default_branch_for(job_id: Uuid) -> String {
    // Trailing hex of a v7 id is random; the leading bits are the timestamp.
    let hex = job_id.simple().to_string();
    format!("testforge/tests-{}", &hex[hex.len() - 12..])
}

fn validate_paths(files: Vec<String>) -> Result<Vec<String>, WorkflowError> {
    if files.is_empty() {
        return Err(WorkflowError::Validation("at least one file is required".into()));
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        if path.trim().is_empty() {
            return Err(WorkflowError::Validation("file path must not be blank".into()));
        }
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(WorkflowError::Validation(format!(
                "file path '{path}' must be relative"
            )));
        }
        if path.split(['/', '\\']).any(|seg| seg == "..") {
            return Err(WorkflowError::Validation(format!(
                "file path '{path}' must not contain '..'"
            )));
        }
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }
    Ok(out)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Fetch one source file with retry; owns its inputs so fetches can run
/// side by side.
async fn fetch_source(
    provider: Arc<dyn ProviderOAuthClient>,
    cred: ProviderCredential,
    repo: RepoId,
    path: String,
    retry: RetryPolicy,
    timeout: Duration,
) -> Result<(String, String), ProviderError> {
    let content = retry
        .run("get_file", || {
            with_deadline(timeout, provider.get_file(&cred, &repo, &path))
        })
        .await?;
    Ok((path, content))
}

/// Reject selections whose tests would be published at the same path.
fn check_test_paths(files: &[String]) -> Result<(), WorkflowError> {
    let mut targets: HashMap<String, &str> = HashMap::new();
    for source in files {
        let target = test_path_for(source);
        if let Some(other) = targets.insert(target.clone(), source.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "'{other}' and '{source}' would both publish tests to '{target}'"
            )));
        }
    }
    Ok(())
}

/// One job's lock. Dropping it also drops the registry entry once no other
/// caller holds or awaits the same mutex.
struct JobLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    job_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.job_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct WorkflowOrchestrator {
    jobs: Arc<dyn JobStore>,
    provider: Arc<dyn ProviderOAuthClient>,
    engine: Arc<dyn GenerationEngine>,
    publisher: PullRequestPublisher,
    config: OrchestratorConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl WorkflowOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        provider: Arc<dyn ProviderOAuthClient>,
        engine: Arc<dyn GenerationEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        let publisher = PullRequestPublisher::new(provider.clone(), config.provider_timeout);
        Self {
            jobs,
            provider,
            engine,
            publisher,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn publisher(&self) -> &PullRequestPublisher {
        &self.publisher
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    async fn lock(&self, job_id: Uuid) -> JobLock<'_> {
        let mutex = self.locks.entry(job_id).or_default().value().clone();
        JobLock {
            locks: &self.locks,
            job_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<GenerationJob, WorkflowError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("job {job_id}")))
    }

    async fn load_owned(&self, job_id: Uuid, subject_id: &str) -> Result<GenerationJob, WorkflowError> {
        let job = self.load(job_id).await?;
        if !job.is_owned_by(subject_id) {
            return Err(WorkflowError::Forbidden(format!("job {job_id}")));
        }
        Ok(job)
    }

    /// Locked read-modify-write; nothing is persisted if `f` fails.
    async fn mutate<F>(&self, job_id: Uuid, f: F) -> Result<GenerationJob, WorkflowError>
    where
        F: FnOnce(&mut GenerationJob) -> Result<(), WorkflowError>,
    {
        let _guard = self.lock(job_id).await;
        let mut job = self.load(job_id).await?;
        f(&mut job)?;
        self.jobs.update(&job).await?;
        Ok(job)
    }

    /// Record `err` on the job as a failure of `step` and hand it back.
    async fn fail_job(&self, job_id: Uuid, step: JobState, err: WorkflowError) -> WorkflowError {
        let failure = JobFailure {
            step,
            kind: err.failure_kind(),
            message: err.to_string(),
        };
        let recorded = self
            .mutate(job_id, |job| {
                transition(job, JobState::Failed)?;
                job.failure = Some(failure);
                Ok(())
            })
            .await;
        match recorded {
            Ok(_) => warn!(%job_id, step = %step, error = %err, "job failed"),
            Err(e) => warn!(%job_id, step = %step, error = %err, record_error = %e, "could not record job failure"),
        }
        err
    }

    /// Validate and persist a new job, leaving it in `fetching_files`.
    pub async fn create_job(
        &self,
        subject_id: &str,
        repo: &str,
        files: Vec<String>,
    ) -> Result<GenerationJob, WorkflowError> {
        let repo: RepoId = repo
            .parse()
            .map_err(|e: InvalidRepoId| WorkflowError::Validation(e.to_string()))?;
        let files = validate_paths(files)?;
        check_test_paths(&files)?;

        let mut job = GenerationJob::new(subject_id, repo, files);
        self.jobs.insert(&job).await?;
        transition(&mut job, JobState::FetchingFiles)?;
        self.jobs.update(&job).await?;
        info!(job_id = %job.id, repo = %job.repo, files = job.selected_files.len(), "job created");
        Ok(job)
    }

    /// Create a job and run it to `ready_for_review`.
    pub async fn submit(
        &self,
        subject_id: &str,
        repo: &str,
        files: Vec<String>,
        cred: &ProviderCredential,
    ) -> Result<GenerationJob, WorkflowError> {
        let job = self.create_job(subject_id, repo, files).await?;
        self.run_pipeline(job.id, cred).await
    }

    /// Run the fetch and generation steps from wherever the job stands.
    pub async fn run_pipeline(
        &self,
        job_id: Uuid,
        cred: &ProviderCredential,
    ) -> Result<GenerationJob, WorkflowError> {
        let job = self.load(job_id).await?;
        let job = match job.state {
            JobState::FetchingFiles => self.fetch_step(job, cred).await?,
            JobState::Generating => job,
            state => {
                return Err(WorkflowError::InvalidState {
                    state,
                    action: "generate tests for",
                });
            }
        };
        self.generate_step(job).await
    }

    async fn fetch_step(
        &self,
        job: GenerationJob,
        cred: &ProviderCredential,
    ) -> Result<GenerationJob, WorkflowError> {
        let fetches: Vec<_> = job
            .selected_files
            .iter()
            .map(|path| {
                fetch_source(
                    self.provider.clone(),
                    cred.clone(),
                    job.repo.clone(),
                    path.clone(),
                    self.config.fetch_retry,
                    self.config.provider_timeout,
                )
            })
            .collect();
        let fetched: Result<Vec<(String, String)>, ProviderError> = stream::iter(fetches)
            .buffered(self.config.fetch_concurrency.max(1))
            .try_collect()
            .await;

        let sources: BTreeMap<String, String> = match fetched {
            Ok(pairs) => pairs.into_iter().collect(),
            Err(e) => {
                return Err(self
                    .fail_job(job.id, JobState::FetchingFiles, e.into())
                    .await);
            }
        };
        debug!(job_id = %job.id, files = sources.len(), "fetched sources");

        self.mutate(job.id, |job| {
            transition(job, JobState::Generating)?;
            job.source_files = sources;
            Ok(())
        })
        .await
    }

    async fn generate_step(&self, job: GenerationJob) -> Result<GenerationJob, WorkflowError> {
        let files: Vec<SourceFile> = job
            .selected_files
            .iter()
            .filter_map(|path| {
                job.source_files.get(path).map(|content| SourceFile {
                    path: path.clone(),
                    content: content.clone(),
                })
            })
            .collect();

        let deadline = self.config.generation_timeout;
        let result = match tokio::time::timeout(deadline, self.engine.generate(&files)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(deadline)),
        };
        let output = match result.and_then(|out| ensure_complete(&files, &out).map(|()| out)) {
            Ok(output) => output,
            Err(e) => {
                return Err(self
                    .fail_job(job.id, JobState::Generating, e.into())
                    .await);
            }
        };

        let job = self
            .mutate(job.id, |job| {
                transition(job, JobState::ReadyForReview)?;
                job.generated_test_cases = output
                    .into_iter()
                    .filter(|(path, _)| job.source_files.contains_key(path))
                    .collect();
                job.failure = None;
                Ok(())
            })
            .await?;
        info!(job_id = %job.id, engine = self.engine.name(), "tests generated");
        Ok(job)
    }

    /// Merge `edits` (source path → test content) and move to `saved`.
    ///
    /// An empty edit set changes nothing and returns the job as it stands.
    pub async fn save_edits(
        &self,
        job_id: Uuid,
        subject_id: &str,
        edits: BTreeMap<String, String>,
    ) -> Result<GenerationJob, WorkflowError> {
        let _guard = self.lock(job_id).await;
        let mut job = self.load_owned(job_id, subject_id).await?;
        if !matches!(job.state, JobState::ReadyForReview | JobState::Saved) {
            return Err(WorkflowError::InvalidState {
                state: job.state,
                action: "save edits to",
            });
        }
        if let Some(unknown) = edits.keys().find(|p| !job.selected_files.contains(p)) {
            return Err(WorkflowError::Validation(format!(
                "'{unknown}' is not one of the job's files"
            )));
        }
        if edits.is_empty() {
            return Ok(job);
        }
        transition(&mut job, JobState::Saved)?;
        job.edited_test_cases.extend(edits);
        self.jobs.update(&job).await?;
        debug!(%job_id, edited = job.edited_test_cases.len(), "edits saved");
        Ok(job)
    }

    /// Publish a saved job as a pull request.
    ///
    /// Publishing an already-published job to the same branch returns it
    /// unchanged.
    pub async fn publish(
        &self,
        job_id: Uuid,
        subject_id: &str,
        cred: &ProviderCredential,
        params: PublishParams,
    ) -> Result<GenerationJob, WorkflowError> {
        let branch = non_blank(params.branch);
        if let Some(branch) = &branch {
            validate_branch_name(branch)?;
        }

        let job = {
            let _guard = self.lock(job_id).await;
            let mut job = self.load_owned(job_id, subject_id).await?;
            if job.state == JobState::Published {
                let same_branch = match (&branch, &job.pull_request) {
                    (None, _) => true,
                    (Some(b), Some(pr)) => *b == pr.branch,
                    (Some(_), None) => false,
                };
                if same_branch {
                    debug!(%job_id, "already published");
                    return Ok(job);
                }
            }
            transition(&mut job, JobState::Publishing)?;
            job.publish_request = Some(PublishRequest {
                branch: branch.unwrap_or_else(|| default_branch_for(job_id)),
                title: non_blank(params.title).unwrap_or_else(|| DEFAULT_PR_TITLE.to_string()),
                description: non_blank(params.description)
                    .unwrap_or_else(|| DEFAULT_PR_BODY.to_string()),
            });
            job.failure = None;
            self.jobs.update(&job).await?;
            job
        };
        self.publish_step(job, cred).await
    }

    async fn publish_step(
        &self,
        job: GenerationJob,
        cred: &ProviderCredential,
    ) -> Result<GenerationJob, WorkflowError> {
        let Some(request) = job.publish_request.clone() else {
            let err = WorkflowError::Validation("job has no publish request".into());
            return Err(self.fail_job(job.id, JobState::Publishing, err).await);
        };
        let files: Vec<CommitFile> = job
            .effective_test_cases()
            .into_iter()
            .map(|(source, content)| CommitFile {
                path: test_path_for(&source),
                content,
            })
            .collect();

        let published = self
            .publisher
            .publish(
                cred,
                &job.repo,
                &request.branch,
                &files,
                &request.title,
                &request.description,
            )
            .await;
        let pr = match published {
            Ok(pr) => pr,
            Err(e) => return Err(self.fail_job(job.id, JobState::Publishing, e).await),
        };

        let job = self
            .mutate(job.id, |job| {
                transition(job, JobState::Published)?;
                job.pull_request = Some(pr);
                Ok(())
            })
            .await?;
        info!(job_id = %job.id, url = ?job.pull_request.as_ref().map(|p| &p.url), "job published");
        Ok(job)
    }

    /// Re-run the step a failed job stopped at.
    pub async fn retry_job(
        &self,
        job_id: Uuid,
        subject_id: &str,
        cred: &ProviderCredential,
    ) -> Result<GenerationJob, WorkflowError> {
        let job = {
            let _guard = self.lock(job_id).await;
            let mut job = self.load_owned(job_id, subject_id).await?;
            let resume = job
                .failure
                .as_ref()
                .filter(|_| job.state == JobState::Failed)
                .and_then(|f| resume_state(f.step))
                .ok_or(WorkflowError::InvalidState {
                    state: job.state,
                    action: "retry",
                })?;
            transition(&mut job, JobState::Retrying)?;
            self.jobs.update(&job).await?;
            transition(&mut job, resume)?;
            job.failure = None;
            self.jobs.update(&job).await?;
            info!(%job_id, resume = %resume, "retrying job");
            job
        };

        match job.state {
            JobState::Publishing => self.publish_step(job, cred).await,
            _ => self.run_pipeline(job.id, cred).await,
        }
    }

    /// A job owned by `subject_id`.
    pub async fn get_job(&self, job_id: Uuid, subject_id: &str) -> Result<GenerationJob, WorkflowError> {
        self.load_owned(job_id, subject_id).await
    }

    /// Jobs owned by `subject_id`, newest first.
    pub async fn list_jobs(&self, subject_id: &str) -> Result<Vec<GenerationJob>, WorkflowError> {
        Ok(self.jobs.list_for_subject(subject_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::FailureKind;
    use crate::models::provider::PullRequestState;
    use crate::provider::ProviderError;
    use crate::store::memory::InMemoryJobStore;
    use crate::testing::{FakeEngine, FakeProvider};

    struct Harness {
        provider: Arc<FakeProvider>,
        engine: Arc<FakeEngine>,
        orchestrator: WorkflowOrchestrator,
        repo: RepoId,
        cred: ProviderCredential,
    }

    fn harness_with(config: OrchestratorConfig) -> Harness {
        let provider = Arc::new(FakeProvider::new());
        let engine = Arc::new(FakeEngine::new());
        let repo = RepoId::new("octo", "calc");
        provider.add_repo(&repo, "main");
        provider.put_file(&repo, "a.py", "def add(a, b): return a + b");
        provider.put_file(&repo, "b.py", "def sub(a, b): return a - b");
        let orchestrator = WorkflowOrchestrator::new(
            Arc::new(InMemoryJobStore::new()),
            provider.clone(),
            engine.clone(),
            config,
        );
        Harness {
            provider,
            engine,
            orchestrator,
            repo,
            cred: ProviderCredential::new("gho_test"),
        }
    }

    fn harness() -> Harness {
        harness_with(OrchestratorConfig::default())
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn edits(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn saved_job(h: &Harness) -> GenerationJob {
        let job = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py", "b.py"]), &h.cred)
            .await
            .unwrap();
        h.orchestrator
            .save_edits(job.id, "alice", edits(&[("a.py", "def test_add(): assert add(1, 2) == 3")]))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_runs_to_ready_for_review() {
        let h = harness();
        let job = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py", "b.py"]), &h.cred)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::ReadyForReview);
        assert_eq!(job.source_files.len(), 2);
        assert_eq!(job.generated_test_cases["a.py"], FakeEngine::output_for("a.py"));
        assert_eq!(h.provider.call_count("get_file"), 2);
        assert_eq!(h.engine.call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_make_no_provider_calls() {
        let h = harness();
        for (repo, paths) in [
            ("octo/calc", vec![]),
            ("octo/calc", files(&[""])),
            ("octo/calc", files(&["/etc/passwd"])),
            ("octo/calc", files(&["src/../secret.py"])),
            ("not-a-repo", files(&["a.py"])),
        ] {
            let err = h
                .orchestrator
                .submit("alice", repo, paths, &h.cred)
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Validation(_)), "{repo}");
        }
        assert_eq!(h.provider.call_count("get_file"), 0);
        assert!(h.orchestrator.list_jobs("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edited_content_wins_in_pull_request() {
        let h = harness();
        let job = saved_job(&h).await;
        assert_eq!(job.state, JobState::Saved);

        let job = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, PublishParams::default())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Published);
        let pr = job.pull_request.clone().unwrap();
        assert_eq!(pr.branch, default_branch_for(job.id));

        let commits = h.provider.commits(&h.repo);
        assert_eq!(commits.len(), 1);
        let committed: BTreeMap<_, _> = commits[0]
            .files
            .iter()
            .map(|f| (f.path.as_str(), f.content.as_str()))
            .collect();
        assert_eq!(committed["test_a.py"], "def test_add(): assert add(1, 2) == 3");
        assert_eq!(committed["test_b.py"], FakeEngine::output_for("b.py"));
    }

    #[tokio::test]
    async fn publish_twice_yields_one_pull_request() {
        let h = harness();
        let job = saved_job(&h).await;
        let params = PublishParams {
            branch: Some("tests/calc".into()),
            ..PublishParams::default()
        };
        let first = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, params.clone())
            .await
            .unwrap();
        let second = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, params)
            .await
            .unwrap();
        assert_eq!(first.pull_request, second.pull_request);
        assert_eq!(h.provider.pull_requests(&h.repo).len(), 1);
        assert_eq!(h.provider.call_count("commit_files"), 1);

        let err = h
            .orchestrator
            .publish(
                job.id,
                "alice",
                &h.cred,
                PublishParams {
                    branch: Some("tests/other".into()),
                    ..PublishParams::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState { state: JobState::Published, .. }));
    }

    #[tokio::test]
    async fn save_and_publish_need_the_right_state() {
        let h = harness();
        let job = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py"]), &h.cred)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, PublishParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState { state: JobState::ReadyForReview, .. }));

        // Nothing to merge: the job is returned untouched.
        let unchanged = h
            .orchestrator
            .save_edits(job.id, "alice", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(unchanged.state, JobState::ReadyForReview);
        assert!(unchanged.edited_test_cases.is_empty());

        let err = h
            .orchestrator
            .save_edits(job.id, "alice", edits(&[("zzz.py", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));

        // Saving twice is fine and merges.
        h.orchestrator
            .save_edits(job.id, "alice", edits(&[("a.py", "one")]))
            .await
            .unwrap();
        let job = h
            .orchestrator
            .save_edits(job.id, "alice", edits(&[("a.py", "two")]))
            .await
            .unwrap();
        assert_eq!(job.edited_test_cases["a.py"], "two");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_errors_are_retried() {
        let h = harness();
        h.provider
            .fail_next("get_file", ProviderError::RateLimited("slow down".into()));
        h.provider
            .fail_next("get_file", ProviderError::Transport("reset".into()));
        let job = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py"]), &h.cred)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::ReadyForReview);
        assert_eq!(h.provider.call_count("get_file"), 3);
    }

    #[tokio::test]
    async fn missing_file_fails_without_retry() {
        let h = harness();
        let err = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py", "missing.py"]), &h.cred)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));

        let jobs = h.orchestrator.list_jobs("alice").await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.state, JobState::Failed);
        let failure = job.failure.as_ref().unwrap();
        assert_eq!(failure.step, JobState::FetchingFiles);
        assert_eq!(failure.kind, FailureKind::NotFound);
        assert_eq!(h.engine.call_count(), 0);
    }

    #[tokio::test]
    async fn engine_failure_then_retry_regenerates_from_stored_sources() {
        let h = harness();
        h.engine
            .fail_next(GenerationError::Rejected("model overloaded".into()));
        let err = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py"]), &h.cred)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Upstream(_)));

        let job = h.orchestrator.list_jobs("alice").await.unwrap().remove(0);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure.as_ref().unwrap().step, JobState::Generating);
        assert_eq!(job.source_files.len(), 1);

        let fetches = h.provider.call_count("get_file");
        let job = h
            .orchestrator
            .retry_job(job.id, "alice", &h.cred)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::ReadyForReview);
        assert!(job.failure.is_none());
        assert_eq!(h.provider.call_count("get_file"), fetches);
        assert_eq!(h.engine.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out() {
        let h = harness_with(OrchestratorConfig {
            generation_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        });
        h.engine.set_delay(Duration::from_secs(60));
        let err = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["a.py"]), &h.cred)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
        let job = h.orchestrator.list_jobs("alice").await.unwrap().remove(0);
        assert_eq!(job.failure.unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn publish_failure_keeps_edits_and_retry_republishes() {
        let h = harness();
        let job = saved_job(&h).await;
        h.provider.fail_next(
            "open_pull_request",
            ProviderError::Upstream {
                status: 502,
                message: "bad gateway".into(),
            },
        );
        let err = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, PublishParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Upstream(_)));

        let failed = h.orchestrator.get_job(job.id, "alice").await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.edited_test_cases, job.edited_test_cases);
        assert_eq!(failed.generated_test_cases, job.generated_test_cases);
        assert!(failed.publish_request.is_some());

        let job = h
            .orchestrator
            .retry_job(job.id, "alice", &h.cred)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Published);
        let open = h
            .provider
            .pull_requests(&h.repo)
            .into_iter()
            .filter(|p| p.state == PullRequestState::Open)
            .count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn merged_pull_request_conflicts_on_republish() {
        let h = harness();
        let job = saved_job(&h).await;
        let params = PublishParams {
            branch: Some("tests/calc".into()),
            title: Some("Add calc tests".into()),
            description: None,
        };
        let published = h
            .orchestrator
            .publish(job.id, "alice", &h.cred, params.clone())
            .await
            .unwrap();
        h.provider
            .close_pull_request(&h.repo, published.pull_request.unwrap().number, true);

        let other = saved_job(&h).await;
        let err = h
            .orchestrator
            .publish(other.id, "alice", &h.cred, params)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        let failed = h.orchestrator.get_job(other.id, "alice").await.unwrap();
        assert_eq!(failed.failure.unwrap().kind, FailureKind::Conflict);
    }

    #[tokio::test]
    async fn retry_only_from_failed() {
        let h = harness();
        let job = saved_job(&h).await;
        let err = h
            .orchestrator
            .retry_job(job.id, "alice", &h.cred)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState { state: JobState::Saved, .. }));
    }

    #[tokio::test]
    async fn jobs_are_private_to_their_subject() {
        let h = harness();
        let job = saved_job(&h).await;
        assert!(matches!(
            h.orchestrator.get_job(job.id, "mallory").await,
            Err(WorkflowError::Forbidden(_))
        ));
        assert!(matches!(
            h.orchestrator
                .save_edits(job.id, "mallory", edits(&[("a.py", "x")]))
                .await,
            Err(WorkflowError::Forbidden(_))
        ));
        assert!(matches!(
            h.orchestrator.get_job(Uuid::nil(), "alice").await,
            Err(WorkflowError::NotFound(_))
        ));
        assert!(h.orchestrator.list_jobs("mallory").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publishing_claim_blocks_concurrent_save() {
        let h = Arc::new(harness());
        let job_id = saved_job(&h).await.id;
        h.provider
            .set_delay("commit_files", Duration::from_secs(2));

        let publishing = {
            let h = h.clone();
            tokio::spawn(async move {
                h.orchestrator
                    .publish(job_id, "alice", &h.cred, PublishParams::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        let err = h
            .orchestrator
            .save_edits(job_id, "alice", edits(&[("a.py", "late edit")]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState { state: JobState::Publishing, .. }));

        let job = publishing.await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Published);
        assert_ne!(job.edited_test_cases["a.py"], "late edit");
    }

    #[test]
    fn default_branch_uses_random_tail_of_id() {
        let id = Uuid::parse_str("0190b0c2-7a6e-7cc0-8f1e-0123456789ab").unwrap();
        assert_eq!(default_branch_for(id), "testforge/tests-0123456789ab");
        assert!(validate_branch_name(&default_branch_for(id)).is_ok());
    }

    #[tokio::test]
    async fn pipeline_runs_on_a_spawned_task() {
        let h = harness();
        let orchestrator = Arc::new(h.orchestrator);
        let cred = h.cred.clone();
        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator
                    .submit("alice", "octo/calc", files(&["a.py", "b.py"]), &cred)
                    .await
            }
        });
        let job = task.await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReadyForReview);

        let retried = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let cred = h.cred.clone();
            async move { orchestrator.retry_job(job.id, "alice", &cred).await }
        });
        assert!(matches!(
            retried.await.unwrap(),
            Err(WorkflowError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn selections_sharing_a_test_path_are_rejected() {
        let h = harness();
        h.provider.put_file(&h.repo, "lib/cart.rb", "class Cart; end");
        h.provider.put_file(&h.repo, "cart.rb", "class Cart; end");

        let err = h
            .orchestrator
            .submit("alice", "octo/calc", files(&["lib/cart.rb", "cart.rb"]), &h.cred)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(ref m) if m.contains("spec/cart_spec.rb")));
        assert_eq!(h.provider.call_count("get_file"), 0);

        assert!(check_test_paths(&files(&["cart.cs", "Cart.cs"])).is_err());
        assert!(check_test_paths(&files(&["a.py", "pkg/a.py"])).is_ok());
    }

    #[tokio::test]
    async fn job_locks_are_released_after_use() {
        let h = harness();
        for _ in 0..5 {
            let job = saved_job(&h).await;
            h.orchestrator
                .publish(
                    job.id,
                    "alice",
                    &h.cred,
                    PublishParams {
                        branch: Some(format!("tests/{}", job.id.simple())),
                        ..PublishParams::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(h.orchestrator.list_jobs("alice").await.unwrap().len(), 5);
        assert_eq!(h.orchestrator.locks.len(), 0);
    }
}
