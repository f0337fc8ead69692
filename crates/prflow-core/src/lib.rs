//! Core git types and traits for prflow.
//!
//! This crate contains:
//! - The provider-neutral git model (users, pull requests, comments, labels)
//! - The `GitClient` capability trait every provider implements
//! - The canonical webhook event
//! - The shared error taxonomy and rate-limit helpers

pub mod client;
pub mod error;
pub mod git;
pub mod webhook;

pub use client::GitClient;
pub use error::{GitError, GitResult};
pub use git::GitProvider;
pub use webhook::{EventType, Webhook};
