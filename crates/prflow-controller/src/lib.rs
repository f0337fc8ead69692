//! Kubernetes controller for prflow.
//!
//! Reconciles `RepoConfig` and `PipelineJob` resources, admits jobs as Tekton
//! pipeline runs under a concurrency limit, and serves the webhook endpoint
//! git providers deliver events to.

pub mod config;
pub mod crd;
pub mod error;
pub mod git;
pub mod job;
pub mod pipeline;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod trigger;

#[cfg(test)]
mod fixtures;

pub use error::{ApiError, Error, Result};
pub use state::AppState;
