//! HTTP routes.

pub mod health;
pub mod webhooks;

use axum::Router;

use crate::AppState;

/// Build the webhook server router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(webhooks::router())
        .merge(health::router())
        .with_state(state)
}
