//! Chatops for prflow.
//!
//! Normalized webhooks are handed to a [`Dispatcher`], which runs every
//! registered [`WebhookPlugin`] and routes slash commands found in new
//! comments to their [`CommandHandler`].

pub mod approve;
pub mod command;
pub mod plugin;

use std::sync::Arc;

pub use approve::{APPROVED_LABEL, ApprovePlugin, approval_verdict, authorize};
pub use command::{Command, extract_commands};
pub use plugin::{CommandHandler, Dispatcher, WebhookPlugin};

/// Dispatcher with the built-in plugins registered.
pub fn default_dispatcher() -> Dispatcher {
    let approve = Arc::new(ApprovePlugin::new());
    let mut dispatcher = Dispatcher::new();
    dispatcher.register_plugin(approve.clone());
    dispatcher.register_handler(approve);
    dispatcher
}
