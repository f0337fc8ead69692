//! GitLab v4 REST and hook payload shapes.

use chrono::{DateTime, NaiveDateTime, Utc};
use prflow_core::git::{Base, IssueLabel, PullRequest, PullRequestAction, PullRequestState, User};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GlUser {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<GlUser> for User {
    fn from(u: GlUser) -> Self {
        User {
            id: u.id,
            name: u.username,
            email: u.email,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GlDiffRefs {
    #[serde(default)]
    pub base_sha: String,
}

#[derive(Debug, Deserialize)]
pub struct GlMergeRequest {
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub web_url: String,
    pub state: String,
    pub author: GlUser,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub diff_refs: Option<GlDiffRefs>,
    #[serde(default)]
    pub merge_status: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl From<GlMergeRequest> for PullRequest {
    fn from(mr: GlMergeRequest) -> Self {
        PullRequest {
            id: mr.iid,
            title: mr.title,
            url: mr.web_url,
            author: mr.author.into(),
            state: merge_request_state(&mr.state),
            action: PullRequestAction::Other,
            head: Base {
                r#ref: mr.source_branch,
                sha: mr.sha,
            },
            base: Base {
                r#ref: mr.target_branch,
                sha: mr.diff_refs.map(|d| d.base_sha).unwrap_or_default(),
            },
            mergeable: mr.merge_status == "can_be_merged",
            labels: mr.labels.into_iter().map(IssueLabel::new).collect(),
            label_changed: Vec::new(),
        }
    }
}

pub fn merge_request_state(state: &str) -> PullRequestState {
    if state == "opened" {
        PullRequestState::Open
    } else {
        PullRequestState::Closed
    }
}

#[derive(Debug, Deserialize)]
pub struct GlHook {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct GlStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GlMember {
    pub access_level: u32,
}

#[derive(Debug, Deserialize)]
pub struct GlNote {
    pub id: i64,
    pub body: String,
    pub author: GlUser,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Deserialize)]
pub struct GlChanges {
    #[serde(default)]
    pub changes: Vec<GlChange>,
}

#[derive(Debug, Deserialize)]
pub struct GlChange {
    pub old_path: String,
    pub new_path: String,
    #[serde(default)]
    pub renamed_file: bool,
    #[serde(default)]
    pub diff: String,
}

#[derive(Debug, Deserialize)]
pub struct GlCommit {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub author_name: String,
}

#[derive(Debug, Deserialize)]
pub struct GlBranch {
    pub name: String,
    pub commit: GlBranchCommit,
}

#[derive(Debug, Deserialize)]
pub struct GlBranchCommit {
    pub id: String,
}

// Hook payloads

#[derive(Debug, Deserialize)]
pub struct HookProject {
    pub path_with_namespace: String,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Deserialize)]
pub struct HookLabel {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct HookCommit {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct HookMergeRequest {
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub state: String,
    #[serde(default)]
    pub action: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default)]
    pub last_commit: Option<HookCommit>,
    #[serde(default)]
    pub oldrev: Option<String>,
    #[serde(default)]
    pub merge_status: String,
    #[serde(default)]
    pub author_id: i64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl HookMergeRequest {
    pub fn into_pull_request(self, labels: Vec<HookLabel>) -> PullRequest {
        let mut pr = PullRequest::new(self.iid, self.title, User::new(self.author_id, ""));
        pr.url = self.url;
        pr.state = merge_request_state(&self.state);
        pr.head = Base {
            r#ref: self.source_branch,
            sha: self.last_commit.map(|c| c.id).unwrap_or_default(),
        };
        pr.base = Base {
            r#ref: self.target_branch,
            sha: String::new(),
        };
        pr.mergeable = self.merge_status == "can_be_merged";
        pr.labels = labels.into_iter().map(|l| IssueLabel::new(l.title)).collect();
        pr
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LabelChange {
    #[serde(default)]
    pub previous: Vec<HookLabel>,
    #[serde(default)]
    pub current: Vec<HookLabel>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HookChanges {
    #[serde(default)]
    pub labels: Option<LabelChange>,
}

#[derive(Debug, Deserialize)]
pub struct MergeRequestHook {
    pub user: GlUser,
    pub project: HookProject,
    pub object_attributes: HookMergeRequest,
    #[serde(default)]
    pub labels: Vec<HookLabel>,
    #[serde(default)]
    pub changes: HookChanges,
}

#[derive(Debug, Deserialize)]
pub struct HookNote {
    pub id: i64,
    pub note: String,
    pub noteable_type: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct NoteHookMergeRequest {
    pub iid: i64,
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub state: String,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default)]
    pub last_commit: Option<HookCommit>,
    #[serde(default)]
    pub author_id: i64,
    #[serde(default)]
    pub merge_status: String,
    #[serde(default)]
    pub labels: Vec<HookLabel>,
}

#[derive(Debug, Deserialize)]
pub struct NoteHook {
    pub user: GlUser,
    pub project: HookProject,
    pub object_attributes: HookNote,
    #[serde(default)]
    pub merge_request: Option<NoteHookMergeRequest>,
}

#[derive(Debug, Deserialize)]
pub struct PushHook {
    pub r#ref: String,
    pub after: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub user_username: String,
    pub project: HookProject,
}

/// Hook timestamps use `2024-01-02 15:04:05 UTC`; newer instances send RFC 3339.
pub fn parse_hook_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S UTC")
        .map(|t| t.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}
