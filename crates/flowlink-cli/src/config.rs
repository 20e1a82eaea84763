//! Application configuration
//!
//! Loaded from a TOML file with every section optional:
//!
//! ```toml
//! [flow]
//! queue_warn_threshold = 1000
//!
//! [link]
//! name = "echo"
//! connect_timeout = 5000
//!
//! [link.heartbeat]
//! interval = 1000
//! threshold_failure_count = 3
//!
//! [strategies]
//! channel = true
//! heartbeat = true
//! recovery = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowlink_core::RuntimeConfig;

use crate::error::{CliError, Result};

/// Which strategies the demo links carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategies {
    pub channel: bool,
    pub heartbeat: bool,
    pub recovery: bool,
}

impl Default for Strategies {
    fn default() -> Self {
        Self {
            channel: true,
            heartbeat: true,
            recovery: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    pub strategies: Strategies,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&text)?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text)?;
        config.runtime.validate().map_err(CliError::Config)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlink_core::LinkConfig;
    use std::time::Duration;

    #[test]
    fn test_sections_are_optional() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [link]
            name = "echo"

            [link.recovery]
            recovery_timeout = 2500

            [strategies]
            channel = false
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.link.name, "echo");
        assert_eq!(config.runtime.link.recovery.recovery_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.runtime.link.recovery.retransmission_window,
            LinkConfig::default().recovery.retransmission_window
        );
        assert!(!config.strategies.channel);
        assert!(config.strategies.recovery);
    }

    #[test]
    fn test_invalid_link_is_rejected() {
        let result = AppConfig::from_toml("[link]\nname = \"\"\n");
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }
}
