//! Canonical webhook event, independent of the provider that sent it.

use serde::{Deserialize, Serialize};

use crate::git::{IssueComment, PullRequest, Repository, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Push,
    PullRequestChanged,
    PullRequestReviewChanged,
    IssueCommentCreated,
}

/// Parsed push data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub r#ref: String,
    pub sha: String,
}

/// A normalized inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub event_type: EventType,
    pub repo: Repository,
    pub sender: User,
    pub push: Option<Push>,
    pub pull_request: Option<PullRequest>,
    pub issue_comment: Option<IssueComment>,
}

impl Webhook {
    pub fn new(event_type: EventType, repo: Repository, sender: User) -> Self {
        Self {
            event_type,
            repo,
            sender,
            push: None,
            pull_request: None,
            issue_comment: None,
        }
    }

    /// Pull request the event is about, whichever payload carries it.
    pub fn target_pull_request(&self) -> Option<&PullRequest> {
        self.pull_request.as_ref().or_else(|| {
            self.issue_comment
                .as_ref()
                .and_then(|c| c.pull_request.as_ref())
        })
    }
}
