//! GitHub REST and webhook payload shapes.

use chrono::{DateTime, Utc};
use prflow_core::git::{
    Base, IssueLabel, PullRequest, PullRequestAction, PullRequestState, ReviewState, User,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GhUser {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<GhUser> for User {
    fn from(u: GhUser) -> Self {
        User {
            id: u.id,
            name: u.login,
            email: u.email,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GhLabel {
    pub name: String,
}

impl From<GhLabel> for IssueLabel {
    fn from(l: GhLabel) -> Self {
        IssueLabel::new(l.name)
    }
}

#[derive(Debug, Deserialize)]
pub struct GhRef {
    pub r#ref: String,
    pub sha: String,
}

impl From<GhRef> for Base {
    fn from(r: GhRef) -> Self {
        Base {
            r#ref: r.r#ref,
            sha: r.sha,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GhPullRequest {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub html_url: String,
    pub state: String,
    pub user: GhUser,
    pub head: GhRef,
    pub base: GhRef,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub labels: Vec<GhLabel>,
}

impl From<GhPullRequest> for PullRequest {
    fn from(pr: GhPullRequest) -> Self {
        PullRequest {
            id: pr.number,
            title: pr.title,
            url: pr.html_url,
            author: pr.user.into(),
            state: pull_request_state(&pr.state),
            action: PullRequestAction::Other,
            head: pr.head.into(),
            base: pr.base.into(),
            mergeable: pr.mergeable.unwrap_or(false),
            labels: pr.labels.into_iter().map(Into::into).collect(),
            label_changed: Vec::new(),
        }
    }
}

pub fn pull_request_state(state: &str) -> PullRequestState {
    if state.eq_ignore_ascii_case("open") {
        PullRequestState::Open
    } else {
        PullRequestState::Closed
    }
}

pub fn pull_request_action(action: &str) -> PullRequestAction {
    match action {
        "opened" => PullRequestAction::Open,
        "closed" => PullRequestAction::Close,
        "reopened" => PullRequestAction::Reopen,
        "synchronize" => PullRequestAction::Synchronize,
        "labeled" => PullRequestAction::Labeled,
        "unlabeled" => PullRequestAction::Unlabeled,
        _ => PullRequestAction::Other,
    }
}

/// Review states arrive lowercase in webhooks and uppercase from the REST API.
pub fn review_state(state: &str) -> Option<ReviewState> {
    match state.to_ascii_lowercase().as_str() {
        "approved" => Some(ReviewState::Approved),
        "changes_requested" | "dismissed" => Some(ReviewState::Unapproved),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct GhRepository {
    pub full_name: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
pub struct GhIssue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub html_url: String,
    pub state: String,
    pub user: GhUser,
    #[serde(default)]
    pub labels: Vec<GhLabel>,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct GhComment {
    pub id: i64,
    #[serde(default)]
    pub body: Option<String>,
    pub user: GhUser,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct GhReview {
    pub id: i64,
    #[serde(default)]
    pub body: Option<String>,
    pub user: GhUser,
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct GhHook {
    pub id: i64,
    pub config: GhHookConfig,
}

#[derive(Debug, Deserialize)]
pub struct GhHookConfig {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct GhStatus {
    pub context: String,
    pub state: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GhPermission {
    pub permission: String,
}

#[derive(Debug, Deserialize)]
pub struct GhFile {
    pub filename: String,
    #[serde(default)]
    pub previous_filename: Option<String>,
    #[serde(default)]
    pub additions: u32,
    #[serde(default)]
    pub deletions: u32,
}

#[derive(Debug, Deserialize)]
pub struct GhCommit {
    pub sha: String,
    pub commit: GhCommitDetail,
}

#[derive(Debug, Deserialize)]
pub struct GhCommitDetail {
    pub message: String,
    #[serde(default)]
    pub author: Option<GhCommitAuthor>,
}

#[derive(Debug, Deserialize)]
pub struct GhCommitAuthor {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct GhBranch {
    pub name: String,
    pub commit: GhBranchCommit,
}

#[derive(Debug, Deserialize)]
pub struct GhBranchCommit {
    pub sha: String,
}

// Webhook payloads

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: GhPullRequest,
    #[serde(default)]
    pub label: Option<GhLabel>,
    pub sender: GhUser,
    pub repository: GhRepository,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestReviewEvent {
    pub action: String,
    pub review: GhReview,
    pub pull_request: GhPullRequest,
    pub sender: GhUser,
    pub repository: GhRepository,
}

#[derive(Debug, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: GhIssue,
    pub comment: GhComment,
    pub sender: GhUser,
    pub repository: GhRepository,
}

#[derive(Debug, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub after: String,
    pub sender: GhUser,
    pub repository: GhRepository,
}
