//! GitHub REST client.

mod types;
mod webhook;

use async_trait::async_trait;
use http::HeaderMap;
use prflow_core::client::default_merge_message;
use prflow_core::git::{
    Branch, Change, Commit, CommitStatus, CommitStatusState, Diff, IssueComment, IssueLabel,
    IssueType, MergeMethod, PullRequest, User, WebhookEntry, sort_newest_first,
};
use prflow_core::webhook::Webhook;
use prflow_core::{GitClient, GitError, GitResult};
use reqwest::Method;
use serde_json::json;
use tracing::{debug, info};

use crate::ClientSettings;
use crate::transport::Transport;
use types::{
    GhBranch, GhComment, GhCommit, GhFile, GhHook, GhIssue, GhLabel, GhPermission,
    GhPullRequest, GhReview, GhStatus, GhUser, review_state,
};

const DEFAULT_API_URL: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";

/// Events a registered webhook subscribes to.
const WEBHOOK_EVENTS: [&str; 4] = ["push", "pull_request", "pull_request_review", "issue_comment"];

/// Body of the 404 GitHub answers when the label is not on the issue.
const MISSING_LABEL_MESSAGE: &str = "Label does not exist";

pub struct GitHubClient {
    transport: Transport,
    api_url: String,
    repository: String,
    webhook_secret: Option<String>,
}

impl GitHubClient {
    pub fn new(settings: &ClientSettings) -> GitResult<Self> {
        if settings.repository.is_empty() {
            return Err(GitError::NotInitialized("repository is empty".to_string()));
        }
        let headers = Transport::bearer_headers(settings.token.as_deref(), ACCEPT)?;
        let api_url = settings
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        Ok(Self {
            transport: Transport::new(headers)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            repository: settings.repository.clone(),
            webhook_secret: settings.webhook_secret.clone(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.api_url, self.repository, path)
    }

    async fn list_issue_comments(&self, id: i64) -> GitResult<Vec<IssueComment>> {
        let comments: Vec<GhComment> = self
            .transport
            .get_all(&self.repo_url(&format!("/issues/{}/comments", id)))
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| IssueComment::new(c.id, c.body.unwrap_or_default(), c.user.into(), c.created_at))
            .collect())
    }

    async fn list_reviews(&self, id: i64) -> GitResult<Vec<IssueComment>> {
        let reviews: Vec<GhReview> = self
            .transport
            .get_all(&self.repo_url(&format!("/pulls/{}/reviews", id)))
            .await?;

        // Pending reviews have no submission time and are invisible to others.
        Ok(reviews
            .into_iter()
            .filter_map(|r| {
                let submitted_at = r.submitted_at?;
                let mut comment = IssueComment::new(
                    r.id,
                    r.body.unwrap_or_default(),
                    r.user.into(),
                    submitted_at,
                );
                comment.review_state = review_state(&r.state);
                Some(comment)
            })
            .collect())
    }
}

fn status_state(state: &str) -> CommitStatusState {
    match state {
        "success" => CommitStatusState::Success,
        "failure" => CommitStatusState::Failure,
        "error" => CommitStatusState::Error,
        _ => CommitStatusState::Pending,
    }
}

#[async_trait]
impl GitClient for GitHubClient {
    fn repository(&self) -> &str {
        &self.repository
    }

    fn parse_webhook(&self, headers: &HeaderMap, body: &[u8]) -> GitResult<Option<Webhook>> {
        webhook::parse(headers, body, self.webhook_secret.as_deref())
    }

    async fn list_webhooks(&self) -> GitResult<Vec<WebhookEntry>> {
        let hooks: Vec<GhHook> = self.transport.get_all(&self.repo_url("/hooks")).await?;
        Ok(hooks
            .into_iter()
            .map(|h| WebhookEntry {
                id: h.id,
                url: h.config.url,
            })
            .collect())
    }

    async fn register_webhook(&self, url: &str) -> GitResult<()> {
        let mut config = json!({
            "url": url,
            "content_type": "json",
            "insecure_ssl": "0",
        });
        if let Some(secret) = &self.webhook_secret {
            config["secret"] = json!(secret);
        }
        let body = json!({
            "name": "web",
            "active": true,
            "events": WEBHOOK_EVENTS,
            "config": config,
        });

        self.transport
            .request(Method::POST, &self.repo_url("/hooks"), Some(&body))
            .await?;
        info!(repository = %self.repository, url, "Registered github webhook");
        Ok(())
    }

    async fn delete_webhook(&self, id: i64) -> GitResult<()> {
        self.transport
            .request(
                Method::DELETE,
                &self.repo_url(&format!("/hooks/{}", id)),
                None,
            )
            .await?;
        Ok(())
    }

    async fn list_commit_statuses(&self, r#ref: &str) -> GitResult<Vec<CommitStatus>> {
        let statuses: Vec<GhStatus> = self
            .transport
            .get_all(&self.repo_url(&format!("/commits/{}/statuses", r#ref)))
            .await?;
        Ok(statuses
            .into_iter()
            .map(|s| CommitStatus {
                context: s.context,
                state: status_state(&s.state),
                description: s.description.unwrap_or_default(),
                target_url: s.target_url,
            })
            .collect())
    }

    async fn set_commit_status(&self, sha: &str, status: CommitStatus) -> GitResult<()> {
        let mut body = json!({
            "state": status.state.to_string(),
            "context": status.context,
            "description": status.description,
        });
        if let Some(target_url) = status.target_url {
            body["target_url"] = json!(target_url);
        }
        self.transport
            .request(
                Method::POST,
                &self.repo_url(&format!("/statuses/{}", sha)),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_user_info(&self, name: &str) -> GitResult<User> {
        let user: GhUser = self
            .transport
            .get_json(&format!("{}/users/{}", self.api_url, name))
            .await?;
        Ok(user.into())
    }

    async fn can_user_write_to_repo(&self, user: &User) -> GitResult<bool> {
        let permission: GhPermission = self
            .transport
            .get_json(&self.repo_url(&format!("/collaborators/{}/permission", user.name)))
            .await?;
        debug!(user = %user.name, permission = %permission.permission, "github permission");
        Ok(matches!(permission.permission.as_str(), "admin" | "write"))
    }

    async fn register_comment(&self, _issue_type: IssueType, id: i64, body: &str) -> GitResult<()> {
        // Pull requests share the issue comment endpoint on GitHub.
        self.transport
            .request(
                Method::POST,
                &self.repo_url(&format!("/issues/{}/comments", id)),
                Some(&json!({ "body": body })),
            )
            .await?;
        Ok(())
    }

    async fn list_comments(&self, id: i64) -> GitResult<Vec<IssueComment>> {
        let mut comments = self.list_issue_comments(id).await?;
        comments.extend(self.list_reviews(id).await?);
        sort_newest_first(&mut comments);
        Ok(comments)
    }

    async fn list_pull_requests(&self, only_open: bool) -> GitResult<Vec<PullRequest>> {
        let state = if only_open { "open" } else { "all" };
        let prs: Vec<GhPullRequest> = self
            .transport
            .get_all(&self.repo_url(&format!("/pulls?state={}", state)))
            .await?;
        Ok(prs.into_iter().map(Into::into).collect())
    }

    async fn get_pull_request(&self, id: i64) -> GitResult<PullRequest> {
        let pr: GhPullRequest = self
            .transport
            .get_json(&self.repo_url(&format!("/pulls/{}", id)))
            .await?;
        Ok(pr.into())
    }

    async fn merge_pull_request(
        &self,
        id: i64,
        sha: &str,
        method: MergeMethod,
        message: &str,
    ) -> GitResult<()> {
        let title = if message.is_empty() {
            default_merge_message(&self.get_pull_request(id).await?)
        } else {
            message.to_string()
        };
        let body = json!({
            "commit_title": title,
            "sha": sha,
            "merge_method": method.to_string(),
        });
        self.transport
            .request(
                Method::PUT,
                &self.repo_url(&format!("/pulls/{}/merge", id)),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_pull_request_diff(&self, id: i64) -> GitResult<Diff> {
        let files: Vec<GhFile> = self
            .transport
            .get_all(&self.repo_url(&format!("/pulls/{}/files", id)))
            .await?;
        Ok(Diff {
            changes: files
                .into_iter()
                .map(|f| Change {
                    filename: f.filename,
                    old_filename: f.previous_filename,
                    additions: f.additions,
                    deletions: f.deletions,
                })
                .collect(),
        })
    }

    async fn list_pull_request_commits(&self, id: i64) -> GitResult<Vec<Commit>> {
        let commits: Vec<GhCommit> = self
            .transport
            .get_all(&self.repo_url(&format!("/pulls/{}/commits", id)))
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| Commit {
                sha: c.sha,
                message: c.commit.message,
                author: c.commit.author.map(|a| a.name).unwrap_or_default(),
            })
            .collect())
    }

    async fn list_labels(&self, id: i64) -> GitResult<Vec<IssueLabel>> {
        let issue: GhIssue = self
            .transport
            .get_json(&self.repo_url(&format!("/issues/{}", id)))
            .await?;
        Ok(issue.labels.into_iter().map(Into::into).collect())
    }

    async fn set_label(&self, _issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        let _: Vec<GhLabel> = self
            .transport
            .request(
                Method::POST,
                &self.repo_url(&format!("/issues/{}/labels", id)),
                Some(&json!({ "labels": [label] })),
            )
            .await?
            .json()?;
        Ok(())
    }

    async fn delete_label(&self, _issue_type: IssueType, id: i64, label: &str) -> GitResult<()> {
        let url = self.repo_url(&format!(
            "/issues/{}/labels/{}",
            id,
            urlencoding::encode(label)
        ));
        match self.transport.request(Method::DELETE, &url, None).await {
            Ok(_) => Ok(()),
            // An unknown repository or issue is also a 404.
            Err(GitError::NotFound(message)) if message.contains(MISSING_LABEL_MESSAGE) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_branch(&self, name: &str) -> GitResult<Branch> {
        let branch: GhBranch = self
            .transport
            .get_json(&self.repo_url(&format!("/branches/{}", name)))
            .await?;
        Ok(Branch {
            name: branch.name,
            commit_sha: branch.commit.sha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prflow_core::GitProvider;
    use prflow_core::git::ReviewState;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GitHubClient {
        let settings = ClientSettings::new(GitProvider::Github, "org/repo")
            .with_api_url(server.uri())
            .with_token("tkn");
        GitHubClient::new(&settings).unwrap()
    }

    fn user(id: i64, login: &str) -> serde_json::Value {
        json!({"id": id, "login": login})
    }

    #[tokio::test]
    async fn test_list_comments_merges_reviews_newest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/issues/7/comments"))
            .and(header("authorization", "Bearer tkn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 1, "body": "/approve", "user": user(2, "bob"), "created_at": "2024-01-01T00:00:00Z"},
                {"id": 3, "body": "/approve cancel", "user": user(2, "bob"), "created_at": "2024-01-03T00:00:00Z"},
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/pulls/7/reviews"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 2, "body": "", "user": user(3, "carol"), "state": "APPROVED", "submitted_at": "2024-01-02T00:00:00Z"},
                {"id": 9, "body": "", "user": user(3, "carol"), "state": "PENDING"},
            ])))
            .mount(&server)
            .await;

        let comments = client(&server).list_comments(7).await.unwrap();

        let ids: Vec<i64> = comments.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(comments[1].review_state, Some(ReviewState::Approved));
    }

    #[tokio::test]
    async fn test_delete_missing_label_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/org/repo/issues/7/labels/approved"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "Label does not exist"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .delete_label(IssueType::PullRequest, 7, "approved")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_label_on_unknown_issue_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/org/repo/issues/7/labels/approved"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete_label(IssueType::PullRequest, 7, "approved")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_label_other_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/repos/org/repo/issues/7/labels/approved"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete_label(IssueType::PullRequest, 7, "approved")
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_write_permission() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/collaborators/bob/permission"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"permission": "write"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/collaborators/eve/permission"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"permission": "read"})))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.can_user_write_to_repo(&User::new(2, "bob")).await.unwrap());
        assert!(!client.can_user_write_to_repo(&User::new(5, "eve")).await.unwrap());
    }

    #[tokio::test]
    async fn test_merge_uses_default_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/pulls/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "number": 7,
                "title": "Add feature",
                "state": "open",
                "user": user(1, "alice"),
                "head": {"ref": "feature", "sha": "abc"},
                "base": {"ref": "main", "sha": "def"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/org/repo/pulls/7/merge"))
            .and(body_partial_json(json!({
                "commit_title": "Add feature(#7)",
                "sha": "abc",
                "merge_method": "squash",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"merged": true})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .merge_pull_request(7, "abc", MergeMethod::Squash, "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_webhooks_paginates() {
        let server = MockServer::start().await;
        let next = format!(r#"<{}/repos/org/repo/hooks/page2>; rel="next""#, server.uri());
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/hooks"))
            .and(query_param("per_page", "100"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", next.as_str())
                    .set_body_json(json!([{"id": 1, "config": {"url": "http://a/webhook/ns/one"}}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/org/repo/hooks/page2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": 2, "config": {"url": "http://a/webhook/ns/two"}}])),
            )
            .mount(&server)
            .await;

        let hooks = client(&server).list_webhooks().await.unwrap();
        assert_eq!(
            hooks,
            vec![
                WebhookEntry { id: 1, url: "http://a/webhook/ns/one".to_string() },
                WebhookEntry { id: 2, url: "http://a/webhook/ns/two".to_string() },
            ]
        );
    }

    #[test]
    fn test_empty_repository_rejected() {
        let err = GitHubClient::new(&ClientSettings::new(GitProvider::Github, ""))
            .err()
            .unwrap();
        assert!(matches!(err, GitError::NotInitialized(_)));
    }
}
