//! Webhook endpoint for git providers.
//!
//! Each RepoConfig registers `/webhook/{namespace}/{name}` with its provider.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::trigger::trigger_job;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook/{namespace}/{name}", post(receive_webhook))
}

/// Authenticate and normalize the payload, then handle it in the background
/// so the provider gets its answer immediately.
async fn receive_webhook(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let config = state
        .store
        .get_config(&namespace, &name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("repo config {}/{} not found", namespace, name)))?;

    let Some(git) = state.git.for_config(&config, state.store.as_ref()).await? else {
        warn!(namespace = %namespace, config = %name, "no git token, ignoring webhook");
        return Ok(StatusCode::ACCEPTED);
    };

    let Some(webhook) = git.parse_webhook(&headers, &body)? else {
        debug!(namespace = %namespace, config = %name, "ignoring unhandled event");
        return Ok(StatusCode::OK);
    };

    info!(
        event = ?webhook.event_type,
        repo = %git.repository(),
        sender = %webhook.sender.name,
        "Received webhook"
    );

    let store = state.store.clone();
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = trigger_job(store.as_ref(), &config, &webhook).await {
            error!(repo = %git.repository(), error = %e, "failed to create pipeline job");
        }
        if let Err(e) = dispatcher.dispatch(&webhook, git.as_ref()).await {
            warn!(repo = %git.repository(), error = %e, "webhook handling failed");
        }
    });

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use prflow_chatops::{APPROVED_LABEL, default_dispatcher};
    use prflow_core::git::{IssueComment, PullRequest, Repository, User};
    use prflow_core::webhook::Push;
    use prflow_core::{EventType, GitClient, Webhook};
    use prflow_git::{FakeClient, FakeStore};
    use tower::ServiceExt;

    use super::*;
    use crate::AppState;
    use crate::fixtures::{REPOSITORY, repo_config, seeded_store};
    use crate::git::GitClients;
    use crate::routes::router;
    use crate::store::memory::MemoryStore;

    fn app(store: Arc<MemoryStore>, git: FakeStore) -> Router {
        router(AppState::new(
            store,
            GitClients::with_fake_store(git),
            default_dispatcher(),
        ))
    }

    fn post_json(uri: &str, webhook: &Webhook) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(webhook).unwrap()))
            .unwrap()
    }

    fn push_event() -> Webhook {
        let mut webhook = Webhook::new(EventType::Push, Repository::default(), User::new(2, "bob"));
        webhook.push = Some(Push {
            r#ref: "refs/heads/main".to_string(),
            sha: "abc123".to_string(),
        });
        webhook
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_unknown_config_is_not_found() {
        let response = app(Arc::new(MemoryStore::new()), FakeStore::new())
            .oneshot(post_json("/webhook/test-ns/missing", &push_event()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_without_token_is_accepted() {
        let store = Arc::new(MemoryStore::new());
        store.add_config(repo_config());
        let response = app(store.clone(), FakeStore::new())
            .oneshot(post_json("/webhook/test-ns/test-ic", &push_event()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(store.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_webhook_secret_rejects_payload() {
        let store = Arc::new(MemoryStore::new());
        let mut config = repo_config();
        config.spec.webhook_secret = Some(crate::crd::SecretKeyRef {
            name: "hook-secret".to_string(),
            key: "secret".to_string(),
        });
        store.add_config(config);
        store.add_secret("test-ns", "git-token", "token", "s3cr3t");
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);

        let response = app(store.clone(), git)
            .oneshot(post_json("/webhook/test-ns/test-ic", &push_event()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhook/test-ns/test-ic")
            .body(Body::from("not json"))
            .unwrap();
        let response = app(Arc::new(seeded_store()), FakeStore::new())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_creates_job() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);

        let response = app(store.clone(), git)
            .oneshot(post_json("/webhook/test-ns/test-ic", &push_event()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(eventually(|| store.created_jobs().len() == 1).await);
        let job = &store.created_jobs()[0];
        assert_eq!(job.spec.refs.sha, "abc123");
        assert_eq!(job.spec.refs.r#ref, "refs/heads/main");
    }

    #[tokio::test]
    async fn test_approve_comment_reaches_plugin() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);
        let pr = PullRequest::new(42, "Fix bug", User::new(1, "alice"));
        git.add_pull_request(REPOSITORY, pr.clone());
        git.set_user_can_write(REPOSITORY, "bob", true);

        let bob = User::new(2, "bob");
        let mut comment = IssueComment::new(100, "/approve", bob.clone(), Utc::now());
        comment.pull_request = Some(pr);
        let mut webhook = Webhook::new(EventType::IssueCommentCreated, Repository::default(), bob);
        webhook.issue_comment = Some(comment);

        let response = app(store.clone(), git.clone())
            .oneshot(post_json("/webhook/test-ns/test-ic", &webhook))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let client = FakeClient::new(git, REPOSITORY);
        let mut labeled = false;
        for _ in 0..100 {
            let labels = client.list_labels(42).await.unwrap();
            if labels.iter().any(|l| l.name == APPROVED_LABEL) {
                labeled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(labeled);
        assert!(store.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(Arc::new(MemoryStore::new()), FakeStore::new())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
