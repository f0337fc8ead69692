//! RepoConfig reconciler.
//!
//! Registers the controller's webhook with the git provider and removes it
//! again when the config is deleted.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use prflow_config::Settings;
use prflow_core::GitClient;
use prflow_core::error::gap_seconds;
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    CONDITION_READY, CONDITION_WEBHOOK_REGISTERED, Condition, ConditionStatus, RepoConfig,
    RepoConfigStatus,
};
use crate::error::{Error, Result};
use crate::git::GitClients;
use crate::store::{ResourceStore, namespace_of};

pub const CONFIG_FINALIZER: &str = "prflow.dev/config-finalizer";

pub const REASON_REGISTERED: &str = "Registered";
pub const REASON_NO_EXTERNAL_HOST: &str = "noExternalHost";
pub const REASON_NO_GIT_TOKEN: &str = "noGitToken";
pub const REASON_GIT_CLIENT_ERROR: &str = "gitCliErr";
pub const REASON_REGISTER_FAILED: &str = "webhookRegisterFailed";

pub struct ConfigContext {
    pub store: Arc<dyn ResourceStore>,
    pub git: GitClients,
    pub settings: Settings,
}

#[instrument(skip(config, ctx), fields(config = %config.name_any()))]
pub async fn reconcile_config(config: Arc<RepoConfig>, ctx: Arc<ConfigContext>) -> Result<Action> {
    let namespace = namespace_of(config.as_ref())?;
    let finalizers = config.finalizers();
    let position = finalizers.iter().position(|f| f == CONFIG_FINALIZER);

    if config.metadata.deletion_timestamp.is_some() {
        if let Some(index) = position {
            delete_webhooks(&config, &namespace, &ctx).await;
            let mut updated = finalizers.to_vec();
            updated.remove(index);
            ctx.store.patch_config_finalizers(&config, &updated).await?;
            info!("webhook cleanup done, finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if position.is_none() {
        let mut updated = finalizers.to_vec();
        updated.push(CONFIG_FINALIZER.to_string());
        ctx.store.patch_config_finalizers(&config, &updated).await?;
        return Ok(Action::await_change());
    }

    let mut status = config.status.clone().unwrap_or_default();
    let mut action = Action::await_change();

    let registered = status
        .condition(CONDITION_WEBHOOK_REGISTERED)
        .is_some_and(Condition::is_true);
    if !registered {
        let (condition, requeue) = register_webhook(&config, &namespace, &ctx).await;
        status.set_condition(condition);
        if let Some(after) = requeue {
            action = Action::requeue(after);
        }
    }

    set_ready(&mut status);
    if config.status.as_ref() != Some(&status) {
        ctx.store.patch_config_status(&config, &status).await?;
    }

    Ok(action)
}

pub fn error_policy(config: Arc<RepoConfig>, err: &Error, ctx: Arc<ConfigContext>) -> Action {
    warn!(config = %config.name_any(), error = %err, "config reconciliation failed");
    Action::requeue(Duration::from_secs(ctx.settings.requeue_seconds))
}

fn webhook_condition(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(CONDITION_WEBHOOK_REGISTERED, status, reason, message)
}

/// Compute the `WebhookRegistered` condition, registering the hook if
/// needed. Also returns how long to wait before retrying a rate-limited
/// registration.
async fn register_webhook(
    config: &RepoConfig,
    namespace: &str,
    ctx: &ConfigContext,
) -> (Condition, Option<Duration>) {
    let Some(url) = ctx.settings.webhook_url(namespace, &config.name_any()) else {
        return (
            webhook_condition(
                ConditionStatus::False,
                REASON_NO_EXTERNAL_HOST,
                "Skipped to register webhook, no external hostname is configured",
            ),
            None,
        );
    };

    let git = match ctx.git.for_config(config, ctx.store.as_ref()).await {
        Ok(Some(git)) => git,
        Ok(None) => {
            return (
                webhook_condition(
                    ConditionStatus::False,
                    REASON_NO_GIT_TOKEN,
                    "Skipped to register webhook",
                ),
                None,
            );
        }
        Err(e) => {
            return (
                webhook_condition(ConditionStatus::False, REASON_GIT_CLIENT_ERROR, e.to_string()),
                None,
            );
        }
    };

    match ensure_registered(git.as_ref(), &url).await {
        Ok(true) => (
            webhook_condition(
                ConditionStatus::True,
                REASON_REGISTERED,
                "Webhook is already registered",
            ),
            None,
        ),
        Ok(false) => {
            info!(url = %url, "webhook registered");
            (
                webhook_condition(ConditionStatus::True, REASON_REGISTERED, "Webhook is registered"),
                None,
            )
        }
        Err(e) => {
            warn!(url = %url, error = %e, "webhook registration failed");
            let requeue = e
                .reset_time()
                .map(|reset| Duration::from_secs(gap_seconds(reset).max(1) as u64));
            (
                webhook_condition(ConditionStatus::False, REASON_REGISTER_FAILED, e.to_string()),
                requeue,
            )
        }
    }
}

/// Register `url` unless an entry for it exists. Returns whether it already did.
async fn ensure_registered(git: &dyn GitClient, url: &str) -> prflow_core::GitResult<bool> {
    let existing = git.list_webhooks().await?;
    if existing.iter().any(|entry| entry.url == url) {
        return Ok(true);
    }
    git.register_webhook(url).await?;
    Ok(false)
}

fn set_ready(status: &mut RepoConfigStatus) {
    let registered = status
        .condition(CONDITION_WEBHOOK_REGISTERED)
        .is_some_and(Condition::is_true);
    let ready = if registered {
        Condition::new(CONDITION_READY, ConditionStatus::True, "Ready", "Ready")
    } else {
        Condition::new(CONDITION_READY, ConditionStatus::False, "NotReady", "Not ready")
    };
    status.set_condition(ready);
}

/// Delete every hook pointing at this config. Failures are logged; they must
/// not keep the config from being deleted.
async fn delete_webhooks(config: &RepoConfig, namespace: &str, ctx: &ConfigContext) {
    let Some(url) = ctx.settings.webhook_url(namespace, &config.name_any()) else {
        return;
    };
    let git = match ctx.git.for_config(config, ctx.store.as_ref()).await {
        Ok(Some(git)) => git,
        Ok(None) => {
            debug!("no git token, leaving webhooks in place");
            return;
        }
        Err(e) => {
            warn!(error = %e, "cannot build git client to delete webhooks");
            return;
        }
    };

    let hooks = match git.list_webhooks().await {
        Ok(hooks) => hooks,
        Err(e) => {
            warn!(error = %e, "failed to list webhooks");
            return;
        }
    };
    for hook in hooks.into_iter().filter(|h| h.url == url) {
        if let Err(e) = git.delete_webhook(hook.id).await {
            warn!(id = hook.id, error = %e, "failed to delete webhook");
        }
    }
}

/// Watch RepoConfigs until shutdown.
pub async fn run_config_controller(client: Client, ctx: Arc<ConfigContext>) {
    let configs: Api<RepoConfig> = match &ctx.settings.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    info!("starting RepoConfig controller");
    Controller::new(configs, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_config, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((config, _)) => debug!(config = %config.name, "reconciled"),
                Err(e) => warn!(error = %e, "RepoConfig reconcile error"),
            }
        })
        .await;
    info!("RepoConfig controller shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{CONFIG, NAMESPACE, REPOSITORY, repo_config, seeded_store};
    use crate::store::memory::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use prflow_config::parse_settings;
    use prflow_git::FakeStore;
    use prflow_git::fake::RATE_LIMIT_MARKER;

    const HOOK_URL: &str = "http://cicd-webhook.com/webhook/test-ns/test-ic";

    fn context(store: Arc<MemoryStore>, git: FakeStore) -> Arc<ConfigContext> {
        Arc::new(ConfigContext {
            store,
            git: GitClients::with_fake_store(git),
            settings: parse_settings(r#"external-hostname "cicd-webhook.com""#).unwrap(),
        })
    }

    fn finalized(mut config: RepoConfig) -> RepoConfig {
        config.metadata.finalizers = Some(vec![CONFIG_FINALIZER.to_string()]);
        config
    }

    fn condition(store: &MemoryStore, type_: &str) -> Condition {
        store
            .config(NAMESPACE, CONFIG)
            .unwrap()
            .status
            .unwrap()
            .condition(type_)
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_first_pass_adds_finalizer() {
        let store = Arc::new(seeded_store());
        let ctx = context(store.clone(), FakeStore::new());

        reconcile_config(Arc::new(repo_config()), ctx).await.unwrap();

        let stored = store.config(NAMESPACE, CONFIG).unwrap();
        assert_eq!(stored.finalizers(), [CONFIG_FINALIZER.to_string()]);
        assert!(stored.status.is_none());
    }

    #[tokio::test]
    async fn test_registers_webhook() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);
        let ctx = context(store.clone(), git.clone());

        reconcile_config(Arc::new(finalized(repo_config())), ctx)
            .await
            .unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.status, ConditionStatus::True);
        assert_eq!(hook.reason, REASON_REGISTERED);
        assert_eq!(hook.message, "Webhook is registered");

        let ready = condition(&store, CONDITION_READY);
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "Ready");

        let hooks = git.repository(REPOSITORY).unwrap().webhooks;
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks.values().next().unwrap().url, HOOK_URL);
    }

    #[tokio::test]
    async fn test_existing_webhook_not_duplicated() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        let client = prflow_git::FakeClient::new(git.clone(), REPOSITORY);
        git.add_repository(REPOSITORY);
        client.register_webhook(HOOK_URL).await.unwrap();
        let ctx = context(store.clone(), git.clone());

        reconcile_config(Arc::new(finalized(repo_config())), ctx)
            .await
            .unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.message, "Webhook is already registered");
        assert_eq!(git.repository(REPOSITORY).unwrap().webhooks.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let store = Arc::new(MemoryStore::new());
        store.add_config(repo_config());
        let ctx = context(store.clone(), FakeStore::new());

        reconcile_config(Arc::new(finalized(repo_config())), ctx)
            .await
            .unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.status, ConditionStatus::False);
        assert_eq!(hook.reason, REASON_NO_GIT_TOKEN);
        let ready = condition(&store, CONDITION_READY);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "NotReady");
        assert_eq!(ready.message, "Not ready");
    }

    #[tokio::test]
    async fn test_no_external_hostname() {
        let store = Arc::new(seeded_store());
        let ctx = Arc::new(ConfigContext {
            store: store.clone(),
            git: GitClients::with_fake_store(FakeStore::new()),
            settings: Settings::default(),
        });

        reconcile_config(Arc::new(finalized(repo_config())), ctx)
            .await
            .unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.reason, REASON_NO_EXTERNAL_HOST);
    }

    #[tokio::test]
    async fn test_client_error() {
        let store = Arc::new(seeded_store());
        // a fake config without a backing store cannot build a client
        let ctx = Arc::new(ConfigContext {
            store: store.clone(),
            git: GitClients::new(),
            settings: parse_settings(r#"external-hostname "cicd-webhook.com""#).unwrap(),
        });

        reconcile_config(Arc::new(finalized(repo_config())), ctx)
            .await
            .unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.reason, REASON_GIT_CLIENT_ERROR);
    }

    #[tokio::test]
    async fn test_rate_limited_registration_requeues() {
        let store = Arc::new(seeded_store());
        let mut config = finalized(repo_config());
        config.spec.git.repository = format!("org/{}", RATE_LIMIT_MARKER);
        let git = FakeStore::new();
        git.add_repository(&config.spec.git.repository);
        let ctx = context(store.clone(), git);

        let action = reconcile_config(Arc::new(config), ctx).await.unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.status, ConditionStatus::False);
        assert_eq!(hook.reason, REASON_REGISTER_FAILED);
        assert!(hook.message.contains("Rate limit exceeded"));
        assert_ne!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_registered_condition_left_alone() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);
        let ctx = context(store.clone(), git.clone());

        let mut config = finalized(repo_config());
        let mut status = RepoConfigStatus::default();
        status.set_condition(webhook_condition(ConditionStatus::True, REASON_REGISTERED, "Registered"));
        config.status = Some(status);

        reconcile_config(Arc::new(config), ctx).await.unwrap();

        let hook = condition(&store, CONDITION_WEBHOOK_REGISTERED);
        assert_eq!(hook.message, "Registered");
        assert_eq!(condition(&store, CONDITION_READY).status, ConditionStatus::True);
        assert!(git.repository(REPOSITORY).unwrap().webhooks.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_removes_own_webhook_and_finalizer() {
        let store = Arc::new(seeded_store());
        let git = FakeStore::new();
        git.add_repository(REPOSITORY);
        let client = prflow_git::FakeClient::new(git.clone(), REPOSITORY);
        client.register_webhook(HOOK_URL).await.unwrap();
        client
            .register_webhook("http://elsewhere/webhook/x/y")
            .await
            .unwrap();
        let ctx = context(store.clone(), git.clone());

        let mut config = repo_config();
        config.metadata.finalizers = Some(vec![
            "keep/me".to_string(),
            CONFIG_FINALIZER.to_string(),
        ]);
        config.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        reconcile_config(Arc::new(config), ctx).await.unwrap();

        let stored = store.config(NAMESPACE, CONFIG).unwrap();
        assert_eq!(stored.finalizers(), ["keep/me"]);
        let hooks = git.repository(REPOSITORY).unwrap().webhooks;
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks.values().next().unwrap().url, "http://elsewhere/webhook/x/y");
    }
}
