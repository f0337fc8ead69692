//! Plugin traits and the webhook dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use prflow_core::{EventType, GitClient, GitResult, Webhook};
use tracing::{debug, warn};

use crate::command::{Command, extract_commands};

/// Receives every normalized webhook.
#[async_trait]
pub trait WebhookPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, webhook: &Webhook, git: &dyn GitClient) -> GitResult<()>;
}

/// Receives slash commands found in newly created comments.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command names, without the leading `/`.
    fn commands(&self) -> &[&'static str];

    async fn handle_command(
        &self,
        command: &Command,
        webhook: &Webhook,
        git: &dyn GitClient,
    ) -> GitResult<()>;
}

/// Routes webhooks to plugins and comment commands to their handlers.
#[derive(Default, Clone)]
pub struct Dispatcher {
    plugins: Vec<Arc<dyn WebhookPlugin>>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_plugin(&mut self, plugin: Arc<dyn WebhookPlugin>) {
        self.plugins.push(plugin);
    }

    /// Register `handler` under every command name it reports. A later
    /// registration for the same name replaces the earlier one.
    pub fn register_handler(&mut self, handler: Arc<dyn CommandHandler>) {
        for name in handler.commands() {
            self.handlers.insert(name.to_string(), handler.clone());
        }
    }

    /// Run every plugin, then every recognized command. A failing plugin does
    /// not stop the others; the first error is returned once all have run.
    pub async fn dispatch(&self, webhook: &Webhook, git: &dyn GitClient) -> GitResult<()> {
        let mut first_error = None;

        for plugin in &self.plugins {
            if let Err(e) = plugin.handle(webhook, git).await {
                warn!(plugin = plugin.name(), repository = git.repository(), error = %e, "Webhook plugin failed");
                first_error.get_or_insert(e);
            }
        }

        if webhook.event_type == EventType::IssueCommentCreated {
            if let Some(comment) = &webhook.issue_comment {
                for command in extract_commands(&comment.body) {
                    let Some(handler) = self.handlers.get(&command.name) else {
                        debug!(command = %command.name, "no handler for command");
                        continue;
                    };
                    if let Err(e) = handler.handle_command(&command, webhook, git).await {
                        warn!(command = %command.name, repository = git.repository(), error = %e, "Command handler failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
