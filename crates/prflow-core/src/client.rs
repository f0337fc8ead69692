//! Git client trait.
//!
//! Every provider implements the same capability set. A client is bound to one
//! repository at construction; all calls target that repository.

use async_trait::async_trait;
use http::HeaderMap;

use crate::error::GitResult;
use crate::git::{
    Branch, Commit, CommitStatus, Diff, IssueComment, IssueLabel, IssueType, MergeMethod,
    PullRequest, User, WebhookEntry,
};
use crate::webhook::Webhook;

#[async_trait]
pub trait GitClient: Send + Sync {
    /// Name of the repository this client is bound to.
    fn repository(&self) -> &str;

    /// Normalize a raw webhook. Returns `None` for events nothing consumes.
    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> GitResult<Option<Webhook>>;

    async fn list_webhooks(&self) -> GitResult<Vec<WebhookEntry>>;

    async fn register_webhook(&self, url: &str) -> GitResult<()>;

    async fn delete_webhook(&self, id: i64) -> GitResult<()>;

    async fn list_commit_statuses(&self, r#ref: &str) -> GitResult<Vec<CommitStatus>>;

    async fn set_commit_status(&self, sha: &str, status: CommitStatus) -> GitResult<()>;

    async fn get_user_info(&self, name: &str) -> GitResult<User>;

    /// Write (GitHub) or developer-and-above (GitLab) privilege.
    async fn can_user_write_to_repo(&self, user: &User) -> GitResult<bool>;

    async fn register_comment(&self, issue_type: IssueType, id: i64, body: &str) -> GitResult<()>;

    /// Comments and reviews, newest first, ties broken by descending id.
    async fn list_comments(&self, id: i64) -> GitResult<Vec<IssueComment>>;

    async fn list_pull_requests(&self, only_open: bool) -> GitResult<Vec<PullRequest>>;

    async fn get_pull_request(&self, id: i64) -> GitResult<PullRequest>;

    /// Merge a pull request. An empty `message` defaults to `<title>(#<id>)`.
    async fn merge_pull_request(
        &self,
        id: i64,
        sha: &str,
        method: MergeMethod,
        message: &str,
    ) -> GitResult<()>;

    async fn get_pull_request_diff(&self, id: i64) -> GitResult<Diff>;

    async fn list_pull_request_commits(&self, id: i64) -> GitResult<Vec<Commit>>;

    async fn list_labels(&self, id: i64) -> GitResult<Vec<IssueLabel>>;

    /// Adding a label that is already present is a no-op.
    async fn set_label(&self, issue_type: IssueType, id: i64, label: &str) -> GitResult<()>;

    /// Removing a label that is not present is a no-op.
    async fn delete_label(&self, issue_type: IssueType, id: i64, label: &str) -> GitResult<()>;

    async fn get_branch(&self, name: &str) -> GitResult<Branch>;
}

/// Default merge commit message.
pub fn default_merge_message(pr: &PullRequest) -> String {
    format!("{}(#{})", pr.title, pr.id)
}
