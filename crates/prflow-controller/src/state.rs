//! Application state.

use std::sync::Arc;

use prflow_chatops::Dispatcher;

use crate::git::GitClients;
use crate::store::ResourceStore;

/// Shared state of the webhook server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ResourceStore>,
    pub git: GitClients,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(store: Arc<dyn ResourceStore>, git: GitClients, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            git,
            dispatcher,
        }
    }
}
