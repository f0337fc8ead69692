//! GitLab hook normalization.

use std::collections::HashSet;

use http::HeaderMap;
use prflow_core::git::{
    IssueComment, IssueLabel, PullRequest, PullRequestAction, Repository, ReviewState, User,
};
use prflow_core::webhook::{EventType, Push, Webhook};
use prflow_core::{GitError, GitResult};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::types::{
    HookProject, LabelChange, MergeRequestHook, NoteHook, PushHook, merge_request_state,
    parse_hook_time,
};

pub fn parse(headers: &HeaderMap, body: &[u8], secret: Option<&str>) -> GitResult<Option<Webhook>> {
    if let Some(secret) = secret {
        let token = headers
            .get("x-gitlab-token")
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !bool::from(token.ct_eq(secret.as_bytes())) {
            return Err(GitError::InvalidWebhook("token mismatch".to_string()));
        }
    }

    let event = headers
        .get("x-gitlab-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match event {
        "Merge Request Hook" => parse_merge_request(body).map(Some),
        "Note Hook" => parse_note(body),
        "Push Hook" => parse_push(body).map(Some),
        _ => {
            debug!(event, "ignoring gitlab event");
            Ok(None)
        }
    }
}

fn repository(project: HookProject) -> Repository {
    Repository {
        name: project.path_with_namespace,
        url: project.web_url,
    }
}

/// Labels that appear on exactly one side of the change, and whether any was added.
fn label_diff(change: &LabelChange) -> (Vec<IssueLabel>, bool) {
    let previous: HashSet<&str> = change.previous.iter().map(|l| l.title.as_str()).collect();
    let current: HashSet<&str> = change.current.iter().map(|l| l.title.as_str()).collect();

    let added: Vec<IssueLabel> = current
        .difference(&previous)
        .map(|l| IssueLabel::new(*l))
        .collect();
    let removed = previous.difference(&current).map(|l| IssueLabel::new(*l));

    let any_added = !added.is_empty();
    let mut changed = added;
    changed.extend(removed);
    (changed, any_added)
}

fn parse_merge_request(body: &[u8]) -> GitResult<Webhook> {
    let hook: MergeRequestHook = serde_json::from_slice(body)?;
    let sender: User = hook.user.into();
    let repo = repository(hook.project);

    let attrs = hook.object_attributes;
    let action = attrs.action.clone().unwrap_or_default();
    let updated_at = attrs.updated_at.as_deref().and_then(parse_hook_time);
    let has_new_commits = attrs.oldrev.as_deref().is_some_and(|r| !r.is_empty());
    let mut pr: PullRequest = attrs.into_pull_request(hook.labels);
    let label_change = hook.changes.labels.as_ref().map(label_diff);
    if let Some((changed, _)) = &label_change {
        pr.label_changed = changed.clone();
    }

    let review_state = match action.as_str() {
        "approved" | "approval" => Some(ReviewState::Approved),
        "unapproved" | "unapproval" => Some(ReviewState::Unapproved),
        _ => None,
    };
    if let Some(state) = review_state {
        let mut review = IssueComment::new(
            0,
            "",
            sender.clone(),
            updated_at.unwrap_or_else(chrono::Utc::now),
        );
        review.review_state = Some(state);
        review.pull_request = Some(pr);

        let mut webhook = Webhook::new(EventType::PullRequestReviewChanged, repo, sender);
        webhook.issue_comment = Some(review);
        return Ok(webhook);
    }

    pr.action = match action.as_str() {
        "open" => PullRequestAction::Open,
        "close" | "merge" => PullRequestAction::Close,
        "reopen" => PullRequestAction::Reopen,
        "update" if has_new_commits => PullRequestAction::Synchronize,
        "update" => match label_change {
            Some((_, true)) => PullRequestAction::Labeled,
            Some((_, false)) => PullRequestAction::Unlabeled,
            None => PullRequestAction::Other,
        },
        _ => PullRequestAction::Other,
    };

    let mut webhook = Webhook::new(EventType::PullRequestChanged, repo, sender);
    webhook.pull_request = Some(pr);
    Ok(webhook)
}

fn parse_note(body: &[u8]) -> GitResult<Option<Webhook>> {
    let hook: NoteHook = serde_json::from_slice(body)?;
    let note = hook.object_attributes;
    let sender: User = hook.user.into();

    let pull_request = match (note.noteable_type.as_str(), hook.merge_request) {
        ("MergeRequest", Some(mr)) => {
            let mut pr = PullRequest::new(mr.iid, mr.title, User::new(mr.author_id, ""));
            pr.url = mr.url;
            pr.state = merge_request_state(&mr.state);
            pr.head.r#ref = mr.source_branch;
            pr.head.sha = mr.last_commit.map(|c| c.id).unwrap_or_default();
            pr.base.r#ref = mr.target_branch;
            pr.mergeable = mr.merge_status == "can_be_merged";
            pr.labels = mr.labels.into_iter().map(|l| IssueLabel::new(l.title)).collect();
            Some(pr)
        }
        ("Issue", _) => None,
        _ => return Ok(None),
    };

    let created_at = parse_hook_time(&note.created_at)
        .ok_or_else(|| GitError::Decode(format!("bad note timestamp {}", note.created_at)))?;
    let mut comment = IssueComment::new(note.id, note.note, sender.clone(), created_at);
    comment.pull_request = pull_request;

    let mut webhook = Webhook::new(
        EventType::IssueCommentCreated,
        repository(hook.project),
        sender,
    );
    webhook.issue_comment = Some(comment);
    Ok(Some(webhook))
}

fn parse_push(body: &[u8]) -> GitResult<Webhook> {
    let hook: PushHook = serde_json::from_slice(body)?;
    let mut webhook = Webhook::new(
        EventType::Push,
        repository(hook.project),
        User::new(hook.user_id, hook.user_username),
    );
    webhook.push = Some(Push {
        r#ref: hook.r#ref,
        sha: hook.after,
    });
    Ok(webhook)
}
