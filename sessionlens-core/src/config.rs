//! Tracker configuration
//!
//! A [`TrackerConfig`] is the declarative input to
//! [`TrackerBuilder`](crate::builder::TrackerBuilder). It can be assembled
//! fluently through the builder, or loaded from TOML and the environment:
//!
//! ```toml
//! log_retention_minutes = 10
//! report_endpoint = "https://collector.example.com/api/sessions"
//! console_report_triggers = ["error"]
//!
//! [features]
//! console_auto_report = true
//! rrweb = false
//!
//! [feature_flags]
//! capture_network = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SessionLensError};
use crate::retention::RetentionWindow;
use crate::types::{FeatureFlags, LogLevel, UserInfo};

/// Configuration file looked up in the working directory by [`TrackerConfig::load`]
pub const CONFIG_FILE: &str = "sessionlens.toml";

/// Environment variable naming an additional configuration file
pub const CONFIG_PATH_ENV: &str = "SESSIONLENS_CONFIG_PATH";

/// Prefix for environment overrides; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "SESSIONLENS_";

/// One-time switches deciding which channels `build()` installs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerFeatures {
    pub console: bool,
    pub network: bool,
    pub dom: bool,
    pub rrweb: bool,
    /// Capture uncaught errors, unhandled rejections and resource failures
    pub auto_error: bool,
    /// Install the page's manual report hook
    pub manual: bool,
    /// Arm report triggers on the console channel
    pub console_auto_report: bool,
}

impl Default for TrackerFeatures {
    fn default() -> Self {
        Self {
            console: true,
            network: true,
            dom: true,
            rrweb: true,
            auto_error: true,
            manual: true,
            console_auto_report: false,
        }
    }
}

/// Options passed through to the replay recorder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    pub mask_all_inputs: bool,
    pub record_canvas: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_text_class: Option<String>,
}

/// Declarative tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub features: TrackerFeatures,

    /// Console levels that schedule a report when `console_auto_report` is on
    pub console_report_triggers: Vec<LogLevel>,

    /// Retention window applied to every time-bounded channel
    pub log_retention_minutes: u64,

    /// Collector URL; without one reports are built but not delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_endpoint: Option<String>,

    /// Maximum retained DOM events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_event_limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrweb_config: Option<ReplayOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,

    /// Live capture toggles, read on every captured event
    #[serde(serialize_with = "serialize_flags_snake_case")]
    pub feature_flags: FeatureFlags,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            features: TrackerFeatures::default(),
            console_report_triggers: Vec::new(),
            log_retention_minutes: RetentionWindow::DEFAULT_MINUTES,
            report_endpoint: None,
            dom_event_limit: None,
            rrweb_config: None,
            user: None,
            feature_flags: FeatureFlags::all_enabled(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `sessionlens.toml` in the working directory
    /// 3. The file named by `SESSIONLENS_CONFIG_PATH`, if set
    /// 4. `SESSIONLENS_*` environment variables (`SESSIONLENS_FEATURES__DOM=false`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is malformed or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(TrackerConfig::default()))
            .merge(Toml::file(CONFIG_FILE));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }

        let config: TrackerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| {
                SessionLensError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single TOML file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(SessionLensError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: TrackerConfig = Figment::from(Serialized::defaults(TrackerConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                SessionLensError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Rejects a zero retention window and a report endpoint that is empty or
    /// not an http(s) URL.
    pub fn validate(&self) -> Result<()> {
        if self.log_retention_minutes == 0 {
            return Err(SessionLensError::Configuration(
                "log_retention_minutes must be at least 1".to_string(),
            ));
        }

        if let Some(endpoint) = &self.report_endpoint {
            if endpoint.trim().is_empty() {
                return Err(SessionLensError::Configuration(
                    "report_endpoint must not be empty".to_string(),
                ));
            }
            let url = reqwest::Url::parse(endpoint).map_err(|e| {
                SessionLensError::Configuration(format!("Invalid report_endpoint {endpoint}: {e}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SessionLensError::Configuration(format!(
                    "report_endpoint must use http or https, got {}",
                    url.scheme()
                )));
            }
        }

        if !self.console_report_triggers.is_empty() && !self.features.console_auto_report {
            tracing::warn!(
                triggers = ?self.console_report_triggers,
                "console_report_triggers set but features.console_auto_report is off; triggers are ignored"
            );
        }

        Ok(())
    }
}

/// Configuration files keep snake_case flag keys, so the defaults layer must
/// emit the same keys the file and environment layers override.
fn serialize_flags_snake_case<S>(
    flags: &FeatureFlags,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;

    let mut map = serializer.serialize_map(None)?;
    if let Some(enabled) = flags.capture_network {
        map.serialize_entry("capture_network", &enabled)?;
    }
    if let Some(enabled) = flags.capture_rrweb {
        map.serialize_entry("capture_rrweb", &enabled)?;
    }
    map.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_builder_defaults() {
        let config = TrackerConfig::default();
        assert!(config.features.console);
        assert!(config.features.manual);
        assert!(!config.features.console_auto_report);
        assert_eq!(config.log_retention_minutes, 5);
        assert_eq!(config.feature_flags, FeatureFlags::all_enabled());
        assert!(config.report_endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_retention_minutes = 2
report_endpoint = "https://collector.example.com/api/sessions"
console_report_triggers = ["error", "warn"]
dom_event_limit = 25

[features]
console_auto_report = true
rrweb = false

[user]
id = "u-42"
plan = "pro"
"#
        )
        .unwrap();

        let config = TrackerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_retention_minutes, 2);
        assert_eq!(
            config.console_report_triggers,
            vec![LogLevel::Error, LogLevel::Warn]
        );
        assert!(config.features.console_auto_report);
        assert!(!config.features.rrweb);
        assert!(config.features.dom);
        assert_eq!(config.dom_event_limit, Some(25));
        let user = config.user.unwrap();
        assert_eq!(user.id.as_deref(), Some("u-42"));
        assert_eq!(user.extra["plan"], "pro");
    }

    #[test]
    fn test_feature_flags_from_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
[feature_flags]
capture_network = false
"#,
            )?;
            jail.set_env("SESSIONLENS_FEATURE_FLAGS__CAPTURE_RRWEB", "false");

            let config = TrackerConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.feature_flags.capture_network, Some(false));
            assert_eq!(config.feature_flags.capture_rrweb, Some(false));

            let from_file = TrackerConfig::from_file(CONFIG_FILE).map_err(|e| e.to_string())?;
            assert_eq!(from_file.feature_flags.capture_network, Some(false));
            assert_eq!(from_file.feature_flags.capture_rrweb, Some(true));
            Ok(())
        });
    }

    #[test]
    fn test_config_keeps_snake_case_flag_keys() {
        let value = serde_json::to_value(TrackerConfig::default()).unwrap();
        assert_eq!(value["feature_flags"]["capture_network"], true);
        assert!(value["feature_flags"].get("captureNetwork").is_none());
    }

    #[test]
    fn test_from_missing_file_fails() {
        let err = TrackerConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, SessionLensError::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = TrackerConfig {
            log_retention_minutes: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        for endpoint in ["", "   ", "not a url", "ftp://collector.example.com"] {
            let config = TrackerConfig {
                report_endpoint: Some(endpoint.to_string()),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{endpoint:?} should be rejected");
        }
    }

    #[test]
    fn test_load_layers_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
log_retention_minutes = 3
[features]
network = false
"#,
            )?;
            jail.create_file("extra.toml", "dom_event_limit = 40")?;
            jail.set_env(CONFIG_PATH_ENV, "extra.toml");
            jail.set_env("SESSIONLENS_FEATURES__DOM", "false");
            jail.set_env("SESSIONLENS_LOG_RETENTION_MINUTES", "7");

            let config = TrackerConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.log_retention_minutes, 7);
            assert!(!config.features.network);
            assert!(!config.features.dom);
            assert!(config.features.console);
            assert_eq!(config.dom_event_limit, Some(40));
            Ok(())
        });
    }
}
