//! KDL configuration for prflow.
//!
//! Parses the operator settings file (`prflow.kdl`).

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{LogFormat, Settings, load_settings, parse_settings};
