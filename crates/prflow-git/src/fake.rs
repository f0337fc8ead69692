//! In-memory git client.
//!
//! All state lives in a [`FakeStore`] handed over at construction, so tests can
//! seed users, pull requests and comments and inspect what the code under test
//! wrote back. Clients built from clones of one store observe each other's
//! writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use http::HeaderMap;
use prflow_core::client::default_merge_message;
use prflow_core::git::{
    Branch, Commit, CommitStatus, Diff, IssueComment, IssueLabel, IssueType, MergeMethod,
    PullRequest, PullRequestState, User, WebhookEntry, sort_newest_first,
};
use prflow_core::webhook::Webhook;
use prflow_core::{GitClient, GitError, GitResult};

/// Repositories whose name contains this marker answer every call with a
/// rate-limit error.
pub const RATE_LIMIT_MARKER: &str = "test-rate-limit";

/// Seconds until the reset time reported by a simulated rate limit.
const RATE_LIMIT_WAIT_SECS: i64 = 100;

#[derive(Debug, Default, Clone)]
pub struct FakeRepository {
    pub webhooks: BTreeMap<i64, WebhookEntry>,
    pub user_can_write: HashMap<String, bool>,
    pub pull_requests: BTreeMap<i64, PullRequest>,
    pub pull_request_diffs: HashMap<i64, Diff>,
    pub pull_request_commits: HashMap<i64, Vec<Commit>>,
    /// Commits by branch name, oldest first.
    pub commits: HashMap<String, Vec<Commit>>,
    /// Statuses by commit sha.
    pub commit_statuses: HashMap<String, Vec<CommitStatus>>,
    /// Comments by issue id, in creation order.
    pub comments: HashMap<i64, Vec<IssueComment>>,
    pub branches: HashMap<String, Branch>,
}

#[derive(Debug, Default)]
struct FakeState {
    users: HashMap<String, User>,
    repositories: HashMap<String, FakeRepository>,
    next_id: i64,
}

/// Shared backing store for [`FakeClient`]s.
#[derive(Debug, Default, Clone)]
pub struct FakeStore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test must not cascade into every other user of the store.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, user: User) {
        self.lock().users.insert(user.name.clone(), user);
    }

    pub fn add_repository(&self, name: &str) {
        self.lock()
            .repositories
            .entry(name.to_string())
            .or_default();
    }

    /// Run `f` against a repository, creating it if missing.
    pub fn with_repository<R>(&self, name: &str, f: impl FnOnce(&mut FakeRepository) -> R) -> R {
        let mut state = self.lock();
        f(state.repositories.entry(name.to_string()).or_default())
    }

    pub fn set_user_can_write(&self, repo: &str, user: &str, can_write: bool) {
        self.with_repository(repo, |r| {
            r.user_can_write.insert(user.to_string(), can_write);
        });
    }

    pub fn add_pull_request(&self, repo: &str, pr: PullRequest) {
        self.with_repository(repo, |r| {
            r.pull_requests.insert(pr.id, pr);
        });
    }

    /// Append a pre-built comment, keeping its id and timestamp.
    pub fn add_comment(&self, repo: &str, issue: i64, comment: IssueComment) {
        self.with_repository(repo, |r| r.comments.entry(issue).or_default().push(comment));
    }

    pub fn add_branch(&self, repo: &str, branch: Branch) {
        self.with_repository(repo, |r| {
            r.branches.insert(branch.name.clone(), branch);
        });
    }

    /// Snapshot of a repository, if it exists.
    pub fn repository(&self, name: &str) -> Option<FakeRepository> {
        self.lock().repositories.get(name).cloned()
    }
}

pub struct FakeClient {
    store: FakeStore,
    repository: String,
}

impl FakeClient {
    pub fn new(store: FakeStore, repository: impl Into<String>) -> Self {
        Self {
            store,
            repository: repository.into(),
        }
    }

    fn check_rate_limit(&self) -> GitResult<()> {
        if self.repository.contains(RATE_LIMIT_MARKER) {
            return Err(GitError::RateLimited {
                reset_at: Utc::now().timestamp() + RATE_LIMIT_WAIT_SECS,
                message: "code 403. Please wait until reset".to_string(),
            });
        }
        Ok(())
    }

    /// Run `f` against this client's repository.
    fn repo<R>(
        &self,
        f: impl FnOnce(&mut FakeRepository, &mut i64) -> GitResult<R>,
    ) -> GitResult<R> {
        self.check_rate_limit()?;
        let mut guard = self.store.lock();
        let state = &mut *guard;
        let repo = state
            .repositories
            .get_mut(&self.repository)
            .ok_or_else(|| GitError::not_found("no such repository"))?;
        f(repo, &mut state.next_id)
    }

    fn pull_request<'a>(repo: &'a mut FakeRepository, id: i64) -> GitResult<&'a mut PullRequest> {
        repo.pull_requests
            .get_mut(&id)
            .ok_or_else(|| GitError::not_found(format!("pull request {}", id)))
    }
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[async_trait]
impl GitClient for FakeClient {
    fn repository(&self) -> &str {
        &self.repository
    }

    /// The fake accepts the canonical event serialized as JSON.
    fn parse_webhook(&self, _headers: &HeaderMap, body: &[u8]) -> GitResult<Option<Webhook>> {
        Ok(Some(serde_json::from_slice(body)?))
    }

    async fn list_webhooks(&self) -> GitResult<Vec<WebhookEntry>> {
        self.repo(|r, _| Ok(r.webhooks.values().cloned().collect()))
    }

    async fn register_webhook(&self, url: &str) -> GitResult<()> {
        self.repo(|r, ids| {
            let id = next(ids);
            r.webhooks.insert(
                id,
                WebhookEntry {
                    id,
                    url: url.to_string(),
                },
            );
            Ok(())
        })
    }

    async fn delete_webhook(&self, id: i64) -> GitResult<()> {
        self.repo(|r, _| {
            r.webhooks
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| GitError::not_found(format!("webhook {}", id)))
        })
    }

    async fn list_commit_statuses(&self, r#ref: &str) -> GitResult<Vec<CommitStatus>> {
        self.repo(|r, _| {
            r.commit_statuses
                .get(r#ref)
                .cloned()
                .ok_or_else(|| GitError::not_found(format!("ref {}", r#ref)))
        })
    }

    async fn set_commit_status(&self, sha: &str, status: CommitStatus) -> GitResult<()> {
        self.repo(|r, _| {
            r.commit_statuses
                .entry(sha.to_string())
                .or_default()
                .push(status);
            Ok(())
        })
    }

    async fn get_user_info(&self, name: &str) -> GitResult<User> {
        self.check_rate_limit()?;
        self.store
            .lock()
            .users
            .get(name)
            .cloned()
            .ok_or_else(|| GitError::not_found(format!("user {}", name)))
    }

    async fn can_user_write_to_repo(&self, user: &User) -> GitResult<bool> {
        self.repo(|r, _| Ok(r.user_can_write.get(&user.name).copied().unwrap_or(false)))
    }

    async fn register_comment(&self, _issue_type: IssueType, id: i64, body: &str) -> GitResult<()> {
        self.repo(|r, ids| {
            let comment = IssueComment::new(next(ids), body, User::default(), Utc::now());
            r.comments.entry(id).or_default().push(comment);
            Ok(())
        })
    }

    async fn list_comments(&self, id: i64) -> GitResult<Vec<IssueComment>> {
        self.repo(|r, _| {
            let mut comments = r.comments.get(&id).cloned().unwrap_or_default();
            sort_newest_first(&mut comments);
            Ok(comments)
        })
    }

    async fn list_pull_requests(&self, only_open: bool) -> GitResult<Vec<PullRequest>> {
        self.repo(|r, _| {
            Ok(r.pull_requests
                .values()
                .filter(|pr| !only_open || pr.is_open())
                .cloned()
                .collect())
        })
    }

    async fn get_pull_request(&self, id: i64) -> GitResult<PullRequest> {
        self.repo(|r, _| Self::pull_request(r, id).map(|pr| pr.clone()))
    }

    async fn merge_pull_request(
        &self,
        id: i64,
        _sha: &str,
        _method: MergeMethod,
        message: &str,
    ) -> GitResult<()> {
        self.repo(|r, _| {
            let pr = Self::pull_request(r, id)?;
            pr.state = PullRequestState::Closed;
            pr.mergeable = false;

            let commit = Commit {
                sha: pr.head.sha.clone(),
                message: if message.is_empty() {
                    default_merge_message(pr)
                } else {
                    message.to_string()
                },
                author: pr.author.name.clone(),
            };
            let base = pr.base.r#ref.clone();
            r.commits.entry(base).or_default().push(commit);
            Ok(())
        })
    }

    async fn get_pull_request_diff(&self, id: i64) -> GitResult<Diff> {
        self.repo(|r, _| {
            r.pull_request_diffs
                .get(&id)
                .cloned()
                .ok_or_else(|| GitError::not_found(format!("diff of pull request {}", id)))
        })
    }

    async fn list_pull_request_commits(&self, id: i64) -> GitResult<Vec<Commit>> {
        self.repo(|r, _| Ok(r.pull_request_commits.get(&id).cloned().unwrap_or_default()))
    }

    async fn list_labels(&self, id: i64) -> GitResult<Vec<IssueLabel>> {
        self.repo(|r, _| Self::pull_request(r, id).map(|pr| pr.labels.clone()))
    }

    async fn set_label(&self, _issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        self.repo(|r, _| {
            let pr = Self::pull_request(r, id)?;
            if !pr.has_label(label) {
                pr.labels.push(IssueLabel::new(label));
            }
            Ok(())
        })
    }

    async fn delete_label(&self, _issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        self.repo(|r, _| {
            let pr = Self::pull_request(r, id)?;
            pr.labels.retain(|l| l.name != label);
            Ok(())
        })
    }

    async fn get_branch(&self, name: &str) -> GitResult<Branch> {
        self.repo(|r, _| {
            r.branches
                .get(name)
                .cloned()
                .ok_or_else(|| GitError::not_found(format!("branch {}", name)))
        })
    }
}
