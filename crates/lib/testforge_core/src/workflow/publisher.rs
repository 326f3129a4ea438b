//! Branch → commit → pull request, safe to repeat for the same branch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::WorkflowError;
use crate::models::job::PullRequestRef;
use crate::models::provider::{CommitFile, RepoId};
use crate::provider::{ProviderCredential, ProviderError, ProviderOAuthClient, with_deadline};

pub const DEFAULT_PR_TITLE: &str = "Add AI-generated tests";
pub const DEFAULT_PR_BODY: &str = "This PR adds tests.";

/// Check a branch name against git's ref-name rules.
pub fn validate_branch_name(branch: &str) -> Result<(), WorkflowError> {
    let bad = branch.is_empty()
        || branch.len() > 200
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.starts_with('-')
        || branch.ends_with('.')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains("@{")
        || branch == "@"
        || branch
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(c));
    if bad {
        Err(WorkflowError::Validation(format!(
            "invalid branch name '{branch}'"
        )))
    } else {
        Ok(())
    }
}

pub struct PullRequestPublisher {
    provider: Arc<dyn ProviderOAuthClient>,
    timeout: Duration,
}

impl PullRequestPublisher {
    pub fn new(provider: Arc<dyn ProviderOAuthClient>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, WorkflowError> {
        Ok(with_deadline(self.timeout, fut).await?)
    }

    /// Publish `files` on `branch` and return the pull request.
    ///
    /// Re-running for the same branch force-moves it to a fresh commit on the
    /// base head and returns the already-open pull request, if any.
    pub async fn publish(
        &self,
        cred: &ProviderCredential,
        repo: &RepoId,
        branch: &str,
        files: &[CommitFile],
        title: &str,
        description: &str,
    ) -> Result<PullRequestRef, WorkflowError> {
        validate_branch_name(branch)?;
        if files.is_empty() {
            return Err(WorkflowError::Validation("nothing to publish".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = files.iter().find(|f| !seen.insert(f.path.as_str())) {
            return Err(WorkflowError::Validation(format!(
                "'{}' appears more than once in the commit",
                dup.path
            )));
        }
        let title = if title.trim().is_empty() {
            DEFAULT_PR_TITLE
        } else {
            title
        };
        let description = if description.trim().is_empty() {
            DEFAULT_PR_BODY
        } else {
            description
        };
        let p = &self.provider;

        if let Some(closed) = self
            .call(p.find_closed_pull_request(cred, repo, branch, title))
            .await?
        {
            return Err(WorkflowError::Conflict(format!(
                "pull request #{} from '{branch}' with this title is already {}",
                closed.number,
                closed.state.as_str()
            )));
        }

        let repository = self.call(p.get_repository(cred, repo)).await?;
        let base_branch = repository.default_branch;
        if base_branch == branch {
            return Err(WorkflowError::Validation(format!(
                "cannot publish onto the default branch '{branch}'"
            )));
        }
        let base = self
            .call(p.get_branch(cred, repo, &base_branch))
            .await?
            .ok_or_else(|| {
                WorkflowError::Upstream(format!("default branch '{base_branch}' has no head"))
            })?;

        match self.call(p.get_branch(cred, repo, branch)).await? {
            Some(existing) => {
                debug!(repo = %repo, branch, sha = %existing.sha, "reusing branch");
            }
            None => {
                let created =
                    with_deadline(self.timeout, p.create_branch(cred, repo, branch, &base.sha))
                        .await;
                match created {
                    Ok(_) => debug!(repo = %repo, branch, "created branch"),
                    // Lost a creation race; the commit below force-moves it anyway.
                    Err(ProviderError::Upstream { status: 422, .. }) => {
                        debug!(repo = %repo, branch, "branch appeared concurrently");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let message = format!("{title}\n\n{description}");
        let sha = self
            .call(p.commit_files(cred, repo, branch, &base.sha, files, &message))
            .await?;

        let pr = match self.call(p.find_open_pull_request(cred, repo, branch)).await? {
            Some(open) => open,
            None => {
                self.call(p.open_pull_request(cred, repo, branch, &base_branch, title, description))
                    .await?
            }
        };
        info!(repo = %repo, branch, number = pr.number, commit = %sha, "pull request ready");

        Ok(PullRequestRef {
            branch: branch.to_string(),
            url: pr.url,
            number: pr.number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::provider::PullRequestState;
    use crate::testing::FakeProvider;

    fn setup() -> (Arc<FakeProvider>, PullRequestPublisher, RepoId) {
        let provider = Arc::new(FakeProvider::new());
        let repo = RepoId::new("octo", "calc");
        provider.add_repo(&repo, "main");
        let publisher = PullRequestPublisher::new(provider.clone(), Duration::from_secs(5));
        (provider, publisher, repo)
    }

    fn files() -> Vec<CommitFile> {
        vec![
            CommitFile {
                path: "test_a.py".into(),
                content: "a".into(),
            },
            CommitFile {
                path: "test_b.py".into(),
                content: "b".into(),
            },
        ]
    }

    #[tokio::test]
    async fn publishes_one_commit_and_one_pull_request() {
        let (provider, publisher, repo) = setup();
        let cred = ProviderCredential::new("t");
        let pr = publisher
            .publish(&cred, &repo, "testforge/tests-1", &files(), "Add tests", "body")
            .await
            .unwrap();
        assert_eq!(pr.branch, "testforge/tests-1");
        assert_eq!(pr.number, 1);

        let commits = provider.commits(&repo);
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].files.len(), 2);
        let prs = provider.pull_requests(&repo);
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].base_branch, "main");
    }

    #[tokio::test]
    async fn publishing_twice_reuses_branch_and_pull_request() {
        let (provider, publisher, repo) = setup();
        let cred = ProviderCredential::new("t");
        let first = publisher
            .publish(&cred, &repo, "feature/tests", &files(), "Add tests", "")
            .await
            .unwrap();
        let second = publisher
            .publish(&cred, &repo, "feature/tests", &files(), "Add tests", "")
            .await
            .unwrap();
        assert_eq!(first, second);
        let open: Vec<_> = provider
            .pull_requests(&repo)
            .into_iter()
            .filter(|p| p.state == PullRequestState::Open)
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(provider.call_count("create_branch"), 1);
        // Both commits sit on the base head: force-push semantics.
        let commits = provider.commits(&repo);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].parent, commits[1].parent);
    }

    #[tokio::test]
    async fn closed_pull_request_with_same_title_conflicts() {
        let (provider, publisher, repo) = setup();
        let cred = ProviderCredential::new("t");
        let pr = publisher
            .publish(&cred, &repo, "feature/tests", &files(), "Add tests", "")
            .await
            .unwrap();
        provider.close_pull_request(&repo, pr.number, true);

        let err = publisher
            .publish(&cred, &repo, "feature/tests", &files(), "Add tests", "")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert_eq!(provider.commits(&repo).len(), 1);

        // A different title is a new pull request.
        publisher
            .publish(&cred, &repo, "feature/tests", &files(), "Add more tests", "")
            .await
            .unwrap();
        assert_eq!(provider.pull_requests(&repo).len(), 2);
    }

    #[tokio::test]
    async fn provider_failures_surface_as_upstream() {
        let (provider, publisher, repo) = setup();
        provider.fail_next(
            "commit_files",
            ProviderError::Upstream {
                status: 500,
                message: "boom".into(),
            },
        );
        let err = publisher
            .publish(&ProviderCredential::new("t"), &repo, "b", &files(), "t", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Upstream(ref m) if m.contains("boom")));
        assert!(provider.pull_requests(&repo).is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_branches_before_calling_provider() {
        let (provider, publisher, repo) = setup();
        for bad in ["", "a..b", "has space", "ends.lock", "/lead", "x~1"] {
            let err = publisher
                .publish(&ProviderCredential::new("t"), &repo, bad, &files(), "t", "d")
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::Validation(_)), "{bad:?}");
        }
        let err = publisher
            .publish(&ProviderCredential::new("t"), &repo, "main", &files(), "t", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert_eq!(provider.call_count("commit_files"), 0);
    }

    #[tokio::test]
    async fn branch_created_concurrently_is_reused() {
        let (provider, publisher, repo) = setup();
        provider.fail_next(
            "create_branch",
            ProviderError::Upstream {
                status: 422,
                message: "Reference already exists".into(),
            },
        );
        let pr = publisher
            .publish(&ProviderCredential::new("t"), &repo, "feature/tests", &files(), "t", "d")
            .await
            .unwrap();
        assert_eq!(pr.number, 1);
        assert_eq!(provider.commits(&repo).len(), 1);
    }

    #[tokio::test]
    async fn other_branch_errors_mentioning_422_still_fail() {
        let (provider, publisher, repo) = setup();
        provider.fail_next(
            "create_branch",
            ProviderError::Upstream {
                status: 500,
                message: "upstream returned 422 to a proxy".into(),
            },
        );
        let err = publisher
            .publish(&ProviderCredential::new("t"), &repo, "feature/tests", &files(), "t", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Upstream(_)));
        assert_eq!(provider.call_count("commit_files"), 0);
    }

    #[tokio::test]
    async fn duplicate_paths_in_one_commit_are_rejected() {
        let (provider, publisher, repo) = setup();
        let mut dup = files();
        dup[1].path = dup[0].path.clone();
        let err = publisher
            .publish(&ProviderCredential::new("t"), &repo, "feature/tests", &dup, "t", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(ref m) if m.contains("test_a.py")));
        assert_eq!(provider.call_count("get_repository"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let (provider, _, repo) = setup();
        provider.set_delay("get_repository", Duration::from_secs(60));
        let publisher = PullRequestPublisher::new(provider.clone(), Duration::from_secs(1));
        let err = publisher
            .publish(&ProviderCredential::new("t"), &repo, "b", &files(), "t", "d")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
    }
}
