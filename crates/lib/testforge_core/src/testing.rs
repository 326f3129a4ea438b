//! In-memory provider and engine fakes.
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! downstream test suites. The fake provider keeps a tiny model of each
//! repository (files, branches, commits, pull requests) so publish behavior
//! can be asserted end to end.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::generation::{GenerationEngine, GenerationError, SourceFile};
use crate::models::provider::{
    BranchRef, CommitFile, FileEntry, FileKind, ProviderIdentity, PullRequest, PullRequestState,
    RepoId, Repository,
};
use crate::provider::{ProviderCredential, ProviderError, ProviderGrant, ProviderOAuthClient};

/// A commit recorded by [`FakeProvider`].
#[derive(Debug, Clone)]
pub struct RecordedCommit {
    pub branch: String,
    pub parent: String,
    pub sha: String,
    pub files: Vec<CommitFile>,
    pub message: String,
}

#[derive(Default)]
struct FakeRepo {
    default_branch: String,
    files: BTreeMap<String, String>,
    branches: HashMap<String, String>,
    commits: Vec<RecordedCommit>,
    pulls: Vec<PullRequest>,
}

#[derive(Default)]
struct FakeState {
    unconfigured: bool,
    grants: HashMap<String, (String, ProviderIdentity)>,
    repos: HashMap<RepoId, FakeRepo>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    delays: HashMap<&'static str, Duration>,
    calls: HashMap<&'static str, usize>,
    next_sha: u64,
}

/// Scriptable [`ProviderOAuthClient`].
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Make `authorize_url` and `exchange_code` fail as unconfigured.
    pub fn set_unconfigured(&self) {
        self.with_state(|s| s.unconfigured = true);
    }

    /// Accept `code`, yielding `access_token` for `identity`.
    pub fn add_grant(&self, code: &str, access_token: &str, identity: ProviderIdentity) {
        self.with_state(|s| {
            s.grants
                .insert(code.to_string(), (access_token.to_string(), identity));
        });
    }

    /// Register a repository whose default branch starts at one commit.
    pub fn add_repo(&self, repo: &RepoId, default_branch: &str) {
        self.with_state(|s| {
            s.next_sha += 1;
            let sha = format!("sha{}", s.next_sha);
            let mut fake = FakeRepo {
                default_branch: default_branch.to_string(),
                ..FakeRepo::default()
            };
            fake.branches.insert(default_branch.to_string(), sha);
            s.repos.insert(repo.clone(), fake);
        });
    }

    pub fn put_file(&self, repo: &RepoId, path: &str, content: &str) {
        self.with_state(|s| {
            if let Some(r) = s.repos.get_mut(repo) {
                r.files.insert(path.to_string(), content.to_string());
            }
        });
    }

    /// Queue `err` as the result of the next `op` call.
    pub fn fail_next(&self, op: &'static str, err: ProviderError) {
        self.with_state(|s| s.failures.entry(op).or_default().push_back(err));
    }

    /// Delay every `op` call by `delay`.
    pub fn set_delay(&self, op: &'static str, delay: Duration) {
        self.with_state(|s| {
            s.delays.insert(op, delay);
        });
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.with_state(|s| s.calls.get(op).copied().unwrap_or(0))
    }

    pub fn commits(&self, repo: &RepoId) -> Vec<RecordedCommit> {
        self.with_state(|s| s.repos.get(repo).map(|r| r.commits.clone()).unwrap_or_default())
    }

    pub fn pull_requests(&self, repo: &RepoId) -> Vec<PullRequest> {
        self.with_state(|s| s.repos.get(repo).map(|r| r.pulls.clone()).unwrap_or_default())
    }

    /// Close (or merge) the pull request with `number`.
    pub fn close_pull_request(&self, repo: &RepoId, number: u64, merged: bool) {
        self.with_state(|s| {
            if let Some(pr) = s
                .repos
                .get_mut(repo)
                .and_then(|r| r.pulls.iter_mut().find(|p| p.number == number))
            {
                pr.state = if merged {
                    PullRequestState::Merged
                } else {
                    PullRequestState::Closed
                };
            }
        });
    }

    /// Count the call, apply any delay, and pop a scripted failure.
    async fn enter(&self, op: &'static str) -> Result<(), ProviderError> {
        let delay = self.with_state(|s| {
            *s.calls.entry(op).or_default() += 1;
            s.delays.get(op).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.with_state(|s| s.failures.get_mut(op).and_then(VecDeque::pop_front)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_repo<T>(
        &self,
        repo: &RepoId,
        f: impl FnOnce(&mut FakeRepo, &mut u64) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        self.with_state(|s| {
            let FakeState {
                repos, next_sha, ..
            } = s;
            let r = repos
                .get_mut(repo)
                .ok_or_else(|| ProviderError::NotFound(format!("repository {repo}")))?;
            f(r, next_sha)
        })
    }
}

#[async_trait]
impl ProviderOAuthClient for FakeProvider {
    fn authorize_url(&self, state: &str) -> Result<String, ProviderError> {
        if self.with_state(|s| s.unconfigured) {
            return Err(ProviderError::NotConfigured("no client id".into()));
        }
        Ok(format!(
            "https://provider.test/login/oauth/authorize?client_id=fake&scope=repo&state={state}"
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderGrant, ProviderError> {
        self.enter("exchange_code").await?;
        if self.with_state(|s| s.unconfigured) {
            return Err(ProviderError::NotConfigured("no client secret".into()));
        }
        self.with_state(|s| s.grants.get(code).cloned())
            .map(|(token, identity)| ProviderGrant {
                credential: ProviderCredential::new(token),
                identity,
            })
            .ok_or_else(|| ProviderError::Unauthorized("bad_verification_code".into()))
    }

    async fn list_repos(&self, _cred: &ProviderCredential) -> Result<Vec<Repository>, ProviderError> {
        self.enter("list_repos").await?;
        Ok(self.with_state(|s| {
            let mut repos: Vec<Repository> = s
                .repos
                .iter()
                .enumerate()
                .map(|(i, (id, r))| Repository {
                    id: i as u64 + 1,
                    name: id.name.clone(),
                    full_name: id.full_name(),
                    private: false,
                    default_branch: r.default_branch.clone(),
                    owner: id.owner.clone(),
                })
                .collect();
            repos.sort_by(|a, b| a.full_name.cmp(&b.full_name));
            repos
        }))
    }

    async fn list_files(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<Vec<FileEntry>, ProviderError> {
        self.enter("list_files").await?;
        let prefix = path.trim_matches('/');
        self.with_repo(repo, |r, _| {
            let mut entries: BTreeMap<String, FileEntry> = BTreeMap::new();
            for (file_path, content) in &r.files {
                let rest = if prefix.is_empty() {
                    file_path.as_str()
                } else if let Some(rest) = file_path.strip_prefix(&format!("{prefix}/")) {
                    rest
                } else {
                    continue;
                };
                let (name, kind) = match rest.split_once('/') {
                    Some((dir, _)) => (dir, FileKind::Dir),
                    None => (rest, FileKind::File),
                };
                let full = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                entries.entry(full.clone()).or_insert(FileEntry {
                    name: name.to_string(),
                    path: full,
                    kind,
                    sha: format!("blob-{name}"),
                    size: if kind == FileKind::File {
                        content.len() as u64
                    } else {
                        0
                    },
                });
            }
            if entries.is_empty() && !prefix.is_empty() {
                return Err(ProviderError::NotFound(format!("{prefix} not found")));
            }
            Ok(entries.into_values().collect())
        })
    }

    async fn get_file(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        path: &str,
    ) -> Result<String, ProviderError> {
        self.enter("get_file").await?;
        self.with_repo(repo, |r, _| {
            r.files
                .get(path)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(format!("{path} not found")))
        })
    }

    async fn get_repository(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
    ) -> Result<Repository, ProviderError> {
        self.enter("get_repository").await?;
        self.with_repo(repo, |r, _| {
            Ok(Repository {
                id: 1,
                name: repo.name.clone(),
                full_name: repo.full_name(),
                private: false,
                default_branch: r.default_branch.clone(),
                owner: repo.owner.clone(),
            })
        })
    }

    async fn get_branch(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
    ) -> Result<Option<BranchRef>, ProviderError> {
        self.enter("get_branch").await?;
        self.with_repo(repo, |r, _| {
            Ok(r.branches.get(branch).map(|sha| BranchRef {
                name: branch.to_string(),
                sha: sha.clone(),
            }))
        })
    }

    async fn create_branch(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        from_sha: &str,
    ) -> Result<BranchRef, ProviderError> {
        self.enter("create_branch").await?;
        self.with_repo(repo, |r, _| {
            if r.branches.contains_key(branch) {
                return Err(ProviderError::Upstream {
                    status: 422,
                    message: "Reference already exists".into(),
                });
            }
            r.branches.insert(branch.to_string(), from_sha.to_string());
            Ok(BranchRef {
                name: branch.to_string(),
                sha: from_sha.to_string(),
            })
        })
    }

    async fn commit_files(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        base_sha: &str,
        files: &[CommitFile],
        message: &str,
    ) -> Result<String, ProviderError> {
        self.enter("commit_files").await?;
        self.with_repo(repo, |r, next_sha| {
            *next_sha += 1;
            let sha = format!("sha{next_sha}");
            r.branches.insert(branch.to_string(), sha.clone());
            r.commits.push(RecordedCommit {
                branch: branch.to_string(),
                parent: base_sha.to_string(),
                sha: sha.clone(),
                files: files.to_vec(),
                message: message.to_string(),
            });
            Ok(sha)
        })
    }

    async fn find_open_pull_request(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
    ) -> Result<Option<PullRequest>, ProviderError> {
        self.enter("find_open_pull_request").await?;
        self.with_repo(repo, |r, _| {
            Ok(r.pulls
                .iter()
                .find(|p| p.head_branch == head && p.state == PullRequestState::Open)
                .cloned())
        })
    }

    async fn find_closed_pull_request(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        title: &str,
    ) -> Result<Option<PullRequest>, ProviderError> {
        self.enter("find_closed_pull_request").await?;
        self.with_repo(repo, |r, _| {
            Ok(r.pulls
                .iter()
                .find(|p| {
                    p.head_branch == head && p.title == title && p.state != PullRequestState::Open
                })
                .cloned())
        })
    }

    async fn open_pull_request(
        &self,
        _cred: &ProviderCredential,
        repo: &RepoId,
        head: &str,
        base: &str,
        title: &str,
        _body: &str,
    ) -> Result<PullRequest, ProviderError> {
        self.enter("open_pull_request").await?;
        self.with_repo(repo, |r, _| {
            if r.pulls
                .iter()
                .any(|p| p.head_branch == head && p.state == PullRequestState::Open)
            {
                return Err(ProviderError::Upstream {
                    status: 422,
                    message: format!("A pull request already exists for {head}"),
                });
            }
            let number = r.pulls.len() as u64 + 1;
            let pr = PullRequest {
                number,
                url: format!("https://provider.test/{repo}/pull/{number}"),
                title: title.to_string(),
                head_branch: head.to_string(),
                base_branch: base.to_string(),
                state: PullRequestState::Open,
            };
            r.pulls.push(pr.clone());
            Ok(pr)
        })
    }
}

/// Scriptable [`GenerationEngine`]: emits `"generated test for <path>"`.
#[derive(Default)]
pub struct FakeEngine {
    failures: Mutex<VecDeque<GenerationError>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<usize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_for(path: &str) -> String {
        format!("generated test for {path}")
    }

    pub fn fail_next(&self, err: GenerationError) {
        if let Ok(mut q) = self.failures.lock() {
            q.push_back(err);
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl GenerationEngine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn generate(
        &self,
        files: &[SourceFile],
    ) -> Result<BTreeMap<String, String>, GenerationError> {
        if let Ok(mut c) = self.calls.lock() {
            *c += 1;
        }
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(files
            .iter()
            .map(|f| (f.path.clone(), Self::output_for(&f.path)))
            .collect())
    }
}
