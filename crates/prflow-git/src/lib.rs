//! Git provider clients for prflow.
//!
//! [`new_client`] turns a [`ClientSettings`] into a `GitClient` bound to one
//! repository: GitHub and GitLab over REST, or the in-memory fake.

pub mod fake;
pub mod github;
pub mod gitlab;
mod transport;

use std::sync::Arc;

use prflow_core::{GitClient, GitError, GitProvider, GitResult};

pub use fake::{FakeClient, FakeStore};
pub use github::GitHubClient;
pub use gitlab::GitLabClient;
pub use transport::{Link, PAGE_SIZE, parse_link_header};

/// Everything needed to construct a client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub provider: GitProvider,
    /// `owner/name` on GitHub, the full project path on GitLab.
    pub repository: String,
    /// Provider base URL; the public service when unset.
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub webhook_secret: Option<String>,
    /// Backing store, required by the fake provider.
    pub fake_store: Option<FakeStore>,
}

impl ClientSettings {
    pub fn new(provider: GitProvider, repository: impl Into<String>) -> Self {
        Self {
            provider,
            repository: repository.into(),
            api_url: None,
            token: None,
            webhook_secret: None,
            fake_store: None,
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_fake_store(mut self, store: FakeStore) -> Self {
        self.fake_store = Some(store);
        self
    }
}

/// Build the client for the configured provider.
pub fn new_client(settings: &ClientSettings) -> GitResult<Arc<dyn GitClient>> {
    match settings.provider {
        GitProvider::Github => Ok(Arc::new(GitHubClient::new(settings)?)),
        GitProvider::Gitlab => Ok(Arc::new(GitLabClient::new(settings)?)),
        GitProvider::Fake => {
            let store = settings.fake_store.clone().ok_or_else(|| {
                GitError::NotInitialized("fake provider requires a store".to_string())
            })?;
            Ok(Arc::new(FakeClient::new(store, settings.repository.clone())))
        }
    }
}
