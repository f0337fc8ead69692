//! Error types shared by every git provider.

use std::fmt::Display;

use chrono::Utc;
use thiserror::Error;

/// Text every rate-limited error message carries.
pub const RATE_LIMIT_TEXT: &str = "Rate limit exceeded";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("not initialized: {0}")]
    NotInitialized(String),

    #[error("404 {0}")]
    NotFound(String),

    /// Rendered as `<sentinel>::<epoch>. Rate limit exceeded, <message>` so
    /// [`rate_limit_reset_time`] can recover the reset time from plain text.
    #[error("ratelimit::{reset_at}. Rate limit exceeded, {message}")]
    RateLimited { reset_at: i64, message: String },

    #[error("user {user} is not authorized on {repo}")]
    Unauthorized { user: String, repo: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("{0}")]
    Unsupported(String),
}

impl GitError {
    pub fn not_found(what: impl Into<String>) -> Self {
        GitError::NotFound(what.into())
    }

    /// Reset epoch of a rate-limited error.
    pub fn reset_time(&self) -> Option<i64> {
        match self {
            GitError::RateLimited { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GitError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, GitError::Unauthorized { .. })
    }
}

impl From<serde_json::Error> for GitError {
    fn from(err: serde_json::Error) -> Self {
        GitError::Decode(err.to_string())
    }
}

pub type GitResult<T> = std::result::Result<T, GitError>;

/// Extract the reset epoch from any error whose text follows the
/// `<sentinel>::<epoch>.<text>` convention. Returns 0 when it does not match.
pub fn rate_limit_reset_time(err: &dyn Display) -> i64 {
    let text = err.to_string();
    if !text.contains(RATE_LIMIT_TEXT) {
        return 0;
    }
    text.split_once("::")
        .and_then(|(_, rest)| rest.split('.').next())
        .and_then(|epoch| epoch.trim().parse().ok())
        .unwrap_or(0)
}

/// Seconds between `target` (unix epoch) and now. Negative once `target` has passed.
pub fn gap_seconds(target: i64) -> i64 {
    target - Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_round_trip() {
        let reset = Utc::now().timestamp() + 100;
        let err = GitError::RateLimited {
            reset_at: reset,
            message: "code 403".to_string(),
        };

        assert_eq!(err.reset_time(), Some(reset));
        assert_eq!(rate_limit_reset_time(&err), reset);

        let gap = gap_seconds(rate_limit_reset_time(&err));
        assert!((99..=100).contains(&gap), "gap was {gap}");
    }

    #[test]
    fn test_rate_limit_message_format() {
        let err = GitError::RateLimited {
            reset_at: 1700000000,
            message: "code 403".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ratelimit::1700000000. Rate limit exceeded, code 403"
        );
    }

    #[test]
    fn test_reset_time_from_foreign_error_text() {
        let text = "unixtime::1650000000. Rate limit exceeded, code 403. Please wait until reset";
        assert_eq!(rate_limit_reset_time(&text), 1650000000);
    }

    #[test]
    fn test_reset_time_absent() {
        let err = GitError::not_found("no such repository");
        assert_eq!(err.reset_time(), None);
        assert_eq!(rate_limit_reset_time(&err), 0);

        let garbled = "x::abc. Rate limit exceeded";
        assert_eq!(rate_limit_reset_time(&garbled), 0);
    }

    #[test]
    fn test_gap_seconds_in_the_past() {
        let past = Utc::now().timestamp() - 10;
        assert!(gap_seconds(past) <= -10);
    }
}
