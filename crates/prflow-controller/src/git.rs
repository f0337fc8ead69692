//! Git clients for repository configs.

use std::sync::Arc;

use prflow_core::GitClient;
use prflow_git::{ClientSettings, FakeStore, new_client};

use crate::crd::RepoConfig;
use crate::error::{Error, Result};
use crate::store::{ResourceStore, namespace_of};

/// Builds the git client a [`RepoConfig`] describes, resolving its secrets
/// through the resource store.
#[derive(Clone, Default)]
pub struct GitClients {
    fake_store: Option<FakeStore>,
}

impl GitClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back `fake` provider configs with `store`.
    pub fn with_fake_store(store: FakeStore) -> Self {
        Self {
            fake_store: Some(store),
        }
    }

    /// Client for `config`, or `None` when it has no readable token.
    ///
    /// A referenced webhook secret that cannot be read is an error, never an
    /// unverified client.
    pub async fn for_config(
        &self,
        config: &RepoConfig,
        store: &dyn ResourceStore,
    ) -> Result<Option<Arc<dyn GitClient>>> {
        let namespace = namespace_of(config)?;
        let git = &config.spec.git;

        let Some(token_ref) = &git.token else {
            return Ok(None);
        };
        let Some(token) = store
            .read_secret(&namespace, &token_ref.name, &token_ref.key)
            .await?
        else {
            return Ok(None);
        };

        let mut settings = ClientSettings::new(git.provider, &git.repository).with_token(token);
        if let Some(url) = &git.api_url {
            settings = settings.with_api_url(url);
        }
        if let Some(secret_ref) = &config.spec.webhook_secret {
            let secret = store
                .read_secret(&namespace, &secret_ref.name, &secret_ref.key)
                .await?
                .ok_or_else(|| {
                    Error::MissingSecret(format!(
                        "{}/{} key {}",
                        namespace, secret_ref.name, secret_ref.key
                    ))
                })?;
            settings = settings.with_webhook_secret(secret);
        }
        if let Some(fake) = &self.fake_store {
            settings = settings.with_fake_store(fake.clone());
        }

        Ok(Some(new_client(&settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyRef;
    use crate::fixtures::{NAMESPACE, repo_config, seeded_store};

    fn config_with_webhook_secret() -> RepoConfig {
        let mut config = repo_config();
        config.spec.webhook_secret = Some(SecretKeyRef {
            name: "hook-secret".to_string(),
            key: "secret".to_string(),
        });
        config
    }

    #[tokio::test]
    async fn test_missing_webhook_secret_is_an_error() {
        let store = seeded_store();
        let err = GitClients::new()
            .for_config(&config_with_webhook_secret(), &store)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::MissingSecret(_)));
        assert!(err.to_string().contains("hook-secret"));
    }

    #[tokio::test]
    async fn test_readable_webhook_secret_builds_client() {
        let store = seeded_store();
        store.add_secret(NAMESPACE, "hook-secret", "secret", "hush");
        let client = GitClients::with_fake_store(prflow_git::FakeStore::new())
            .for_config(&config_with_webhook_secret(), &store)
            .await
            .unwrap();
        assert!(client.is_some());
    }

    #[tokio::test]
    async fn test_missing_token_yields_no_client() {
        let store = crate::store::memory::MemoryStore::new();
        let client = GitClients::new()
            .for_config(&config_with_webhook_secret(), &store)
            .await
            .unwrap();
        assert!(client.is_none());
    }
}
