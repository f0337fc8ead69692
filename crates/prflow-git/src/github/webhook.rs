//! GitHub webhook normalization.

use hmac::{Hmac, Mac};
use http::HeaderMap;
use prflow_core::git::{IssueComment, PullRequest, PullRequestAction, Repository};
use prflow_core::webhook::{EventType, Push, Webhook};
use prflow_core::{GitError, GitResult};
use sha2::Sha256;
use tracing::debug;

use super::types::{
    GhRepository, IssueCommentEvent, PullRequestEvent, PullRequestReviewEvent, PushEvent,
    pull_request_action, pull_request_state, review_state,
};

pub fn parse(headers: &HeaderMap, body: &[u8], secret: Option<&str>) -> GitResult<Option<Webhook>> {
    if let Some(secret) = secret {
        let signature = header(headers, "x-hub-signature-256");
        if !verify_signature(secret, body, signature) {
            return Err(GitError::InvalidWebhook("signature mismatch".to_string()));
        }
    }

    let event = header(headers, "x-github-event").unwrap_or_default();
    match event {
        "pull_request" => parse_pull_request(body).map(Some),
        "pull_request_review" => parse_review(body),
        "issue_comment" => parse_issue_comment(body),
        "push" => parse_push(body).map(Some),
        _ => {
            debug!(event, "ignoring github event");
            Ok(None)
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn repository(repo: GhRepository) -> Repository {
    Repository {
        name: repo.full_name,
        url: repo.html_url,
    }
}

fn parse_pull_request(body: &[u8]) -> GitResult<Webhook> {
    let event: PullRequestEvent = serde_json::from_slice(body)?;

    let mut pr: PullRequest = event.pull_request.into();
    pr.action = pull_request_action(&event.action);
    if matches!(
        pr.action,
        PullRequestAction::Labeled | PullRequestAction::Unlabeled
    ) {
        pr.label_changed = event.label.into_iter().map(Into::into).collect();
    }

    let mut webhook = Webhook::new(
        EventType::PullRequestChanged,
        repository(event.repository),
        event.sender.into(),
    );
    webhook.pull_request = Some(pr);
    Ok(webhook)
}

fn parse_review(body: &[u8]) -> GitResult<Option<Webhook>> {
    let event: PullRequestReviewEvent = serde_json::from_slice(body)?;
    if event.action != "submitted" && event.action != "dismissed" {
        return Ok(None);
    }

    let state = if event.action == "dismissed" {
        "dismissed"
    } else {
        event.review.state.as_str()
    };
    let review_state = review_state(state);

    let created_at = event.review.submitted_at.unwrap_or_else(chrono::Utc::now);
    let mut comment = IssueComment::new(
        event.review.id,
        event.review.body.unwrap_or_default(),
        event.review.user.into(),
        created_at,
    );
    comment.review_state = review_state;
    comment.pull_request = Some(event.pull_request.into());

    let mut webhook = Webhook::new(
        EventType::PullRequestReviewChanged,
        repository(event.repository),
        event.sender.into(),
    );
    webhook.issue_comment = Some(comment);
    Ok(Some(webhook))
}

fn parse_issue_comment(body: &[u8]) -> GitResult<Option<Webhook>> {
    let event: IssueCommentEvent = serde_json::from_slice(body)?;
    if event.action != "created" {
        return Ok(None);
    }

    let issue = event.issue;
    let pull_request = issue.pull_request.is_some().then(|| {
        let mut pr = PullRequest::new(issue.number, issue.title, issue.user.into());
        pr.url = issue.html_url;
        pr.state = pull_request_state(&issue.state);
        pr.labels = issue.labels.into_iter().map(Into::into).collect();
        pr
    });

    let mut comment = IssueComment::new(
        event.comment.id,
        event.comment.body.unwrap_or_default(),
        event.comment.user.into(),
        event.comment.created_at,
    );
    comment.pull_request = pull_request;

    let mut webhook = Webhook::new(
        EventType::IssueCommentCreated,
        repository(event.repository),
        event.sender.into(),
    );
    webhook.issue_comment = Some(comment);
    Ok(Some(webhook))
}

fn parse_push(body: &[u8]) -> GitResult<Webhook> {
    let event: PushEvent = serde_json::from_slice(body)?;
    let mut webhook = Webhook::new(
        EventType::Push,
        repository(event.repository),
        event.sender.into(),
    );
    webhook.push = Some(Push {
        r#ref: event.r#ref,
        sha: event.after,
    });
    Ok(webhook)
}

/// Verify an `X-Hub-Signature-256` header of the form `sha256=<hex>`.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
