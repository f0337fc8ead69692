//! Operator settings (`prflow.kdl`).

use std::net::SocketAddr;
use std::path::Path;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:24335";
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
pub const DEFAULT_REQUEUE_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Controller-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Address the webhook server binds to.
    pub listen: SocketAddr,
    /// Host git providers deliver webhooks to. Registration is skipped without it.
    pub external_hostname: Option<String>,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub max_concurrent_jobs: usize,
    pub log_format: LogFormat,
    /// Back-off after a failed reconcile.
    pub requeue_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 24335)),
            external_hostname: None,
            namespace: None,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            log_format: LogFormat::Text,
            requeue_seconds: DEFAULT_REQUEUE_SECONDS,
        }
    }
}

impl Settings {
    /// Callback URL registered for a repository config.
    pub fn webhook_url(&self, namespace: &str, name: &str) -> Option<String> {
        self.external_hostname
            .as_ref()
            .map(|host| format!("http://{}/webhook/{}/{}", host, namespace, name))
    }
}

/// Parse settings from KDL text. Every node is optional.
pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        let name = node.name().value();
        match name {
            "listen" => {
                let value = require_string(node, name)?;
                settings.listen = value.parse().map_err(|e| ConfigError::InvalidValue {
                    field: name.to_string(),
                    message: format!("{}: {}", value, e),
                })?;
            }
            "external-hostname" => {
                settings.external_hostname = Some(require_string(node, name)?);
            }
            "namespace" => {
                settings.namespace = Some(require_string(node, name)?);
            }
            "max-concurrent-jobs" => {
                let value = require_positive(node, name)?;
                settings.max_concurrent_jobs =
                    usize::try_from(value).map_err(|e| ConfigError::InvalidValue {
                        field: name.to_string(),
                        message: e.to_string(),
                    })?;
            }
            "log-format" => {
                settings.log_format = match require_string(node, name)?.as_str() {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: name.to_string(),
                            message: format!("expected \"text\" or \"json\", got \"{}\"", other),
                        });
                    }
                };
            }
            "requeue-seconds" => {
                let value = require_positive(node, name)?;
                settings.requeue_seconds =
                    u64::try_from(value).map_err(|e| ConfigError::InvalidValue {
                        field: name.to_string(),
                        message: e.to_string(),
                    })?;
            }
            other => return Err(ConfigError::UnknownSetting(other.to_string())),
        }
    }

    Ok(settings)
}

/// Read and parse a settings file.
pub fn load_settings(path: &Path) -> ConfigResult<Settings> {
    let text = std::fs::read_to_string(path)?;
    parse_settings(&text)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn require_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn require_positive(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    let value =
        get_first_integer_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if value < 1 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be at least 1, got {}", value),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_settings() {
        let kdl = r#"
            listen "127.0.0.1:8080"
            external-hostname "cicd-webhook.example.com"
            namespace "ci"
            max-concurrent-jobs 8
            log-format "json"
            requeue-seconds 10
        "#;

        let settings = parse_settings(kdl).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(
            settings.external_hostname.as_deref(),
            Some("cicd-webhook.example.com")
        );
        assert_eq!(settings.namespace.as_deref(), Some("ci"));
        assert_eq!(settings.max_concurrent_jobs, 8);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.requeue_seconds, 10);
    }

    #[test]
    fn test_empty_document_gives_defaults() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.listen.to_string(), DEFAULT_LISTEN);
        assert!(settings.webhook_url("ns", "cfg").is_none());
    }

    #[test]
    fn test_webhook_url() {
        let settings = parse_settings(r#"external-hostname "hooks.example.com""#).unwrap();
        assert_eq!(
            settings.webhook_url("default", "my-repo").as_deref(),
            Some("http://hooks.example.com/webhook/default/my-repo")
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            parse_settings("max-concurrent-jobs 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_settings(r#"log-format "xml""#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_settings(r#"listen "not an address""#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_settings("namespace"),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_unknown_setting_rejected() {
        assert!(matches!(
            parse_settings(r#"colour "blue""#),
            Err(ConfigError::UnknownSetting(_))
        ));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            parse_settings("listen \"unterminated"),
            Err(ConfigError::Parse(_))
        ));
    }
}
