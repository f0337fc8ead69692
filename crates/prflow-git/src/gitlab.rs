//! GitLab v4 REST client.

mod types;
mod webhook;

use async_trait::async_trait;
use http::HeaderMap;
use prflow_core::client::default_merge_message;
use prflow_core::git::{
    Branch, Change, Commit, CommitStatus, CommitStatusState, Diff, IssueComment, IssueLabel,
    IssueType, MergeMethod, PullRequest, ReviewState, User, WebhookEntry, sort_newest_first,
};
use prflow_core::webhook::Webhook;
use prflow_core::{GitClient, GitError, GitResult};
use reqwest::Method;
use serde_json::json;
use tracing::{debug, info};

use crate::ClientSettings;
use crate::transport::Transport;
use types::{
    GlBranch, GlChanges, GlCommit, GlHook, GlMember, GlMergeRequest, GlNote, GlStatus, GlUser,
};

const DEFAULT_API_URL: &str = "https://gitlab.com";

/// Developer access level; anything at or above it may push.
const DEVELOPER_ACCESS: u32 = 30;

pub struct GitLabClient {
    transport: Transport,
    project_url: String,
    repository: String,
    webhook_secret: Option<String>,
}

impl GitLabClient {
    pub fn new(settings: &ClientSettings) -> GitResult<Self> {
        if settings.repository.is_empty() {
            return Err(GitError::NotInitialized("repository is empty".to_string()));
        }
        let headers = Transport::bearer_headers(settings.token.as_deref(), "application/json")?;
        let api_url = settings
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/');

        Ok(Self {
            transport: Transport::new(headers)?,
            project_url: format!(
                "{}/api/v4/projects/{}",
                api_url,
                urlencoding::encode(&settings.repository)
            ),
            repository: settings.repository.clone(),
            webhook_secret: settings.webhook_secret.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.project_url, path)
    }

    fn issue_path(issue_type: IssueType, id: i64) -> String {
        match issue_type {
            IssueType::PullRequest => format!("/merge_requests/{}", id),
            IssueType::Issue => format!("/issues/{}", id),
        }
    }

    fn api_root(&self) -> &str {
        self.project_url
            .split_once("/projects/")
            .map(|(root, _)| root)
            .unwrap_or(&self.project_url)
    }
}

fn status_state(state: &str) -> CommitStatusState {
    match state {
        "success" => CommitStatusState::Success,
        "failed" | "canceled" => CommitStatusState::Failure,
        _ => CommitStatusState::Pending,
    }
}

fn gitlab_status(state: CommitStatusState) -> &'static str {
    match state {
        CommitStatusState::Pending => "pending",
        CommitStatusState::Success => "success",
        CommitStatusState::Failure | CommitStatusState::Error => "failed",
    }
}

/// Map a note to a comment. System notes only matter when they record an approval.
fn note_to_comment(note: GlNote) -> Option<IssueComment> {
    let review_state = if note.system {
        match note.body.as_str() {
            "approved this merge request" => Some(ReviewState::Approved),
            "unapproved this merge request" => Some(ReviewState::Unapproved),
            _ => return None,
        }
    } else {
        None
    };
    let mut comment = IssueComment::new(note.id, note.body, note.author.into(), note.created_at);
    comment.review_state = review_state;
    Some(comment)
}

/// Count added and removed lines of a unified diff hunk.
fn count_lines(diff: &str) -> (u32, u32) {
    diff.lines().fold((0, 0), |(add, del), line| {
        if line.starts_with('+') && !line.starts_with("+++") {
            (add + 1, del)
        } else if line.starts_with('-') && !line.starts_with("---") {
            (add, del + 1)
        } else {
            (add, del)
        }
    })
}

#[async_trait]
impl GitClient for GitLabClient {
    fn repository(&self) -> &str {
        &self.repository
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> GitResult<Option<Webhook>> {
        webhook::parse(headers, body, self.webhook_secret.as_deref())
    }

    async fn list_webhooks(&self) -> GitResult<Vec<WebhookEntry>> {
        let hooks: Vec<GlHook> = self.transport.get_all(&self.url("/hooks")).await?;
        Ok(hooks
            .into_iter()
            .map(|h| WebhookEntry { id: h.id, url: h.url })
            .collect())
    }

    async fn register_webhook(&self, url: &str) -> GitResult<()> {
        let mut body = json!({
            "url": url,
            "push_events": true,
            "merge_requests_events": true,
            "note_events": true,
            "enable_ssl_verification": false,
        });
        if let Some(secret) = &self.webhook_secret {
            body["token"] = json!(secret);
        }
        self.transport
            .request(Method::POST, &self.url("/hooks"), Some(&body))
            .await?;
        info!(repository = %self.repository, url, "Registered gitlab webhook");
        Ok(())
    }

    async fn delete_webhook(&self, id: i64) -> GitResult<()> {
        self.transport
            .request(Method::DELETE, &self.url(&format!("/hooks/{}", id)), None)
            .await?;
        Ok(())
    }

    async fn list_commit_statuses(&self, r#ref: &str) -> GitResult<Vec<CommitStatus>> {
        let statuses: Vec<GlStatus> = self
            .transport
            .get_all(&self.url(&format!("/repository/commits/{}/statuses", r#ref)))
            .await?;
        Ok(statuses
            .into_iter()
            .map(|s| CommitStatus {
                context: s.name,
                state: status_state(&s.status),
                description: s.description.unwrap_or_default(),
                target_url: s.target_url,
            })
            .collect())
    }

    async fn set_commit_status(&self, sha: &str, status: CommitStatus) -> GitResult<()> {
        let mut body = json!({
            "state": gitlab_status(status.state),
            "name": status.context,
            "description": status.description,
        });
        if let Some(target_url) = status.target_url {
            body["target_url"] = json!(target_url);
        }
        self.transport
            .request(
                Method::POST,
                &self.url(&format!("/statuses/{}", sha)),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_user_info(&self, name: &str) -> GitResult<User> {
        let url = format!(
            "{}/users?username={}",
            self.api_root(),
            urlencoding::encode(name)
        );
        let users: Vec<GlUser> = self.transport.get_json(&url).await?;
        users
            .into_iter()
            .next()
            .map(Into::into)
            .ok_or_else(|| GitError::not_found(format!("user {}", name)))
    }

    async fn can_user_write_to_repo(&self, user: &User) -> GitResult<bool> {
        let url = self.url(&format!("/members/all/{}", user.id));
        match self.transport.get_json::<GlMember>(&url).await {
            Ok(member) => {
                debug!(user = %user.name, access_level = member.access_level, "gitlab access");
                Ok(member.access_level >= DEVELOPER_ACCESS)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn register_comment(&self, issue_type: IssueType, id: i64, body: &str) -> GitResult<()> {
        let url = self.url(&format!("{}/notes", Self::issue_path(issue_type, id)));
        self.transport
            .request(Method::POST, &url, Some(&json!({ "body": body })))
            .await?;
        Ok(())
    }

    async fn list_comments(&self, id: i64) -> GitResult<Vec<IssueComment>> {
        let notes: Vec<GlNote> = self
            .transport
            .get_all(&self.url(&format!("/merge_requests/{}/notes?sort=desc", id)))
            .await?;
        let mut comments: Vec<IssueComment> = notes.into_iter().filter_map(note_to_comment).collect();
        sort_newest_first(&mut comments);
        Ok(comments)
    }

    async fn list_pull_requests(&self, only_open: bool) -> GitResult<Vec<PullRequest>> {
        let state = if only_open { "opened" } else { "all" };
        let mrs: Vec<GlMergeRequest> = self
            .transport
            .get_all(&self.url(&format!("/merge_requests?state={}", state)))
            .await?;
        Ok(mrs.into_iter().map(Into::into).collect())
    }

    async fn get_pull_request(&self, id: i64) -> GitResult<PullRequest> {
        let mr: GlMergeRequest = self
            .transport
            .get_json(&self.url(&format!("/merge_requests/{}", id)))
            .await?;
        Ok(mr.into())
    }

    async fn merge_pull_request(
        &self,
        id: i64,
        sha: &str,
        method: MergeMethod,
        message: &str,
    ) -> GitResult<()> {
        let message = if message.is_empty() {
            default_merge_message(&self.get_pull_request(id).await?)
        } else {
            message.to_string()
        };
        let squash = method == MergeMethod::Squash;
        let mut body = json!({
            "sha": sha,
            "squash": squash,
            "merge_commit_message": message,
        });
        if squash {
            body["squash_commit_message"] = json!(message);
        }
        self.transport
            .request(
                Method::PUT,
                &self.url(&format!("/merge_requests/{}/merge", id)),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_pull_request_diff(&self, id: i64) -> GitResult<Diff> {
        let changes: GlChanges = self
            .transport
            .get_json(&self.url(&format!("/merge_requests/{}/changes", id)))
            .await?;
        Ok(Diff {
            changes: changes
                .changes
                .into_iter()
                .map(|c| {
                    let (additions, deletions) = count_lines(&c.diff);
                    Change {
                        old_filename: c.renamed_file.then_some(c.old_path),
                        filename: c.new_path,
                        additions,
                        deletions,
                    }
                })
                .collect(),
        })
    }

    async fn list_pull_request_commits(&self, id: i64) -> GitResult<Vec<Commit>> {
        let commits: Vec<GlCommit> = self
            .transport
            .get_all(&self.url(&format!("/merge_requests/{}/commits", id)))
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| Commit {
                sha: c.id,
                message: c.message,
                author: c.author_name,
            })
            .collect())
    }

    async fn list_labels(&self, id: i64) -> GitResult<Vec<IssueLabel>> {
        let pr = self.get_pull_request(id).await?;
        Ok(pr.labels)
    }

    async fn set_label(&self, issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        let url = self.url(&Self::issue_path(issue_type, id));
        self.transport
            .request(Method::PUT, &url, Some(&json!({ "add_labels": label })))
            .await?;
        Ok(())
    }

    async fn delete_label(&self, issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        // remove_labels ignores labels that are not set
        let url = self.url(&Self::issue_path(issue_type, id));
        self.transport
            .request(Method::PUT, &url, Some(&json!({ "remove_labels": label })))
            .await?;
        Ok(())
    }

    async fn get_branch(&self, name: &str) -> GitResult<Branch> {
        let branch: GlBranch = self
            .transport
            .get_json(&self.url(&format!(
                "/repository/branches/{}",
                urlencoding::encode(name)
            )))
            .await?;
        Ok(Branch {
            name: branch.name,
            commit_sha: branch.commit.id,
        })
    }
}
