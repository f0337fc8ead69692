//! Provider-neutral git objects.

use chrono::{DateTime, Utc};
use derive_more::Display;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Git provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
    /// Deterministic in-memory double, only constructible with an explicit store.
    Fake,
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitProvider::Github => write!(f, "github"),
            GitProvider::Gitlab => write!(f, "gitlab"),
            GitProvider::Fake => write!(f, "fake"),
        }
    }
}

impl std::str::FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(GitProvider::Github),
            "gitlab" => Ok(GitProvider::Gitlab),
            "fake" => Ok(GitProvider::Fake),
            _ => Err(format!("git type {} is not supported", s)),
        }
    }
}

/// A remote account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
}

impl User {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: None,
        }
    }

    /// Whether both values denote the same account. Some payloads only carry
    /// the id, others only the login, so either matching is enough.
    pub fn is_same(&self, other: &User) -> bool {
        (self.id != 0 && self.id == other.id)
            || (!self.name.is_empty() && self.name == other.name)
    }
}

/// Repository referenced by a webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
}

/// A registered webhook callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEntry {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatusState {
    #[display("pending")]
    Pending,
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("error")]
    Error,
}

/// A status check attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub context: String,
    pub state: CommitStatusState,
    pub description: String,
    pub target_url: Option<String>,
}

/// Which kind of issue a comment or label targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueType {
    Issue,
    PullRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum PullRequestState {
    #[display("open")]
    Open,
    #[display("closed")]
    Closed,
}

/// What happened to a pull request in the event that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullRequestAction {
    Open,
    Close,
    Reopen,
    Synchronize,
    Labeled,
    Unlabeled,
    Other,
}

/// Approval signal carried by a review event or a review listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    Approved,
    Unapproved,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueLabel {
    pub name: String,
}

impl IssueLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A branch tip referenced by a pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Base {
    pub r#ref: String,
    pub sha: String,
}

/// Snapshot of a remote pull/merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub author: User,
    pub state: PullRequestState,
    pub action: PullRequestAction,
    pub head: Base,
    pub base: Base,
    pub mergeable: bool,
    pub labels: Vec<IssueLabel>,
    /// Labels added or removed by the event that produced this snapshot.
    pub label_changed: Vec<IssueLabel>,
}

impl PullRequest {
    pub fn new(id: i64, title: impl Into<String>, author: User) -> Self {
        Self {
            id,
            title: title.into(),
            url: String::new(),
            author,
            state: PullRequestState::Open,
            action: PullRequestAction::Other,
            head: Base::default(),
            base: Base::default(),
            mergeable: true,
            labels: Vec::new(),
            label_changed: Vec::new(),
        }
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name == name)
    }

    pub fn is_open(&self) -> bool {
        self.state == PullRequestState::Open
    }
}

/// A comment, or a review, on an issue or pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    /// Provider-assigned id; breaks ties between equal timestamps.
    pub id: i64,
    pub body: String,
    pub author: User,
    pub created_at: DateTime<Utc>,
    pub review_state: Option<ReviewState>,
    /// The pull request the comment belongs to, if it is not a plain issue.
    pub pull_request: Option<PullRequest>,
}

impl IssueComment {
    pub fn new(id: i64, body: impl Into<String>, author: User, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            body: body.into(),
            author,
            created_at,
            review_state: None,
            pull_request: None,
        }
    }
}

/// Order comments newest first, falling back to the id when timestamps tie.
pub fn sort_newest_first(comments: &mut [IssueComment]) {
    comments.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MergeMethod {
    #[display("merge")]
    Merge,
    #[display("squash")]
    Squash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
}

/// A file touched by a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub filename: String,
    pub old_filename: Option<String>,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn comment(id: i64, secs: i64) -> IssueComment {
        IssueComment::new(
            id,
            format!("comment {id}"),
            User::new(1, "bob"),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    #[test]
    fn test_sort_newest_first_with_tie_break() {
        let mut comments = vec![comment(1, 100), comment(3, 300), comment(2, 300)];
        sort_newest_first(&mut comments);

        let ids: Vec<i64> = comments.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_user_is_same() {
        assert!(User::new(7, "alice").is_same(&User::new(7, "")));
        assert!(User::new(0, "alice").is_same(&User::new(0, "alice")));
        assert!(!User::new(7, "alice").is_same(&User::new(8, "bob")));
        assert!(!User::new(0, "").is_same(&User::new(0, "")));
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("GitHub".parse::<GitProvider>(), Ok(GitProvider::Github));
        assert_eq!("gitlab".parse::<GitProvider>(), Ok(GitProvider::Gitlab));
        assert_eq!(
            "dummy".parse::<GitProvider>(),
            Err("git type dummy is not supported".to_string())
        );
    }
}
