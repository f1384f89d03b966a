//! Harness timing and naming configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file named by
//! `DLS_CONFIG`, then individual `DLS_*` environment variables.
//!
//! ```toml
//! request_timeout = "10s"
//! status_poll_interval = "100ms"
//! retry_delay = "61s"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use dls_common::DEFAULT_FILENAME_PREFIX;
use dls_common::config::{ConfigSource, EnvParser, Sourced};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_FILE_ENV: &str = "DLS_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// How long to wait for the worker to contact the mock peer.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Upper bound on one sleep inside a status wait.
    #[serde(with = "duration_str")]
    pub status_poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub drain_timeout: Duration,
    #[serde(with = "duration_str")]
    pub drain_poll_interval: Duration,
    /// Fixed sleep after draining.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    /// Fake-clock advance that makes a parked retry due.
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    pub filename_prefix: String,
    /// Keep each scenario's data directory instead of deleting it.
    pub keep_scenario_dirs: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            status_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(1),
            drain_poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(50),
            retry_delay: Duration::from_secs(61),
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            keep_scenario_dirs: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults, then `DLS_CONFIG`, then `DLS_*` overrides; validated.
    pub fn load() -> anyhow::Result<Self> {
        let mut parser = EnvParser::new();
        let file = parser.get_optional_path("CONFIG");

        let mut config = match &file.value {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&mut parser);

        let errors = parser.take_errors();
        if !errors.is_empty() {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            anyhow::bail!("Invalid harness environment: {}", details.join("; "));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read harness config {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse harness config {}", path.display()))?;
        debug!(path = %path.display(), source = %ConfigSource::File, "loaded harness config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from `DLS_*` variables, accumulating parse errors in
    /// `parser`.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        let mut duration = |name: &str, field: &mut Duration| {
            note(name, parser.get_duration(name, *field), field);
        };
        duration("REQUEST_TIMEOUT", &mut self.request_timeout);
        duration("STATUS_POLL_INTERVAL", &mut self.status_poll_interval);
        duration("DRAIN_TIMEOUT", &mut self.drain_timeout);
        duration("DRAIN_POLL_INTERVAL", &mut self.drain_poll_interval);
        duration("GRACE_PERIOD", &mut self.grace_period);
        duration("RETRY_DELAY", &mut self.retry_delay);

        let prefix = parser.get_string("FILENAME_PREFIX", &self.filename_prefix);
        note("FILENAME_PREFIX", prefix, &mut self.filename_prefix);
        let keep = parser.get_bool("KEEP_SCENARIO_DIRS", self.keep_scenario_dirs);
        note("KEEP_SCENARIO_DIRS", keep, &mut self.keep_scenario_dirs);
    }

    /// Reject settings that would make every wait fail or spin.
    pub fn validate(&self) -> HarnessResult<()> {
        let nonzero = [
            ("request_timeout", self.request_timeout),
            ("status_poll_interval", self.status_poll_interval),
            ("drain_timeout", self.drain_timeout),
            ("drain_poll_interval", self.drain_poll_interval),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| value.is_zero()) {
            return Err(HarnessError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.status_poll_interval > self.request_timeout {
            return Err(HarnessError::InvalidConfig(format!(
                "status_poll_interval ({:?}) exceeds request_timeout ({:?})",
                self.status_poll_interval, self.request_timeout
            )));
        }
        if self.drain_poll_interval > self.drain_timeout {
            return Err(HarnessError::InvalidConfig(format!(
                "drain_poll_interval ({:?}) exceeds drain_timeout ({:?})",
                self.drain_poll_interval, self.drain_timeout
            )));
        }
        if self.filename_prefix.contains(['/', '\\']) {
            return Err(HarnessError::InvalidConfig(format!(
                "filename_prefix '{}' must not contain path separators",
                self.filename_prefix
            )));
        }
        Ok(())
    }
}

fn note<T: std::fmt::Debug>(name: &str, sourced: Sourced<T>, field: &mut T) {
    if sourced.is_overridden() {
        debug!(
            setting = name,
            value = ?sourced.value,
            env_var = sourced.env_var.as_deref().unwrap_or_default(),
            "harness setting overridden"
        );
    }
    *field = sourced.value;
}

/// Durations as humantime strings (`"250ms"`, `"1m 1s"`), or bare milliseconds.
mod duration_str {
    use std::time::Duration;

    use serde::de::{self, Deserializer};
    use serde::{Deserialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(millis) => Ok(Duration::from_millis(millis)),
            Raw::Text(text) => dls_common::config::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "DLS_CONFIG",
        "DLS_REQUEST_TIMEOUT",
        "DLS_STATUS_POLL_INTERVAL",
        "DLS_RETRY_DELAY",
        "DLS_FILENAME_PREFIX",
        "DLS_KEEP_SCENARIO_DIRS",
    ];

    fn cleanup_env() {
        for var in VARS {
            // SAFETY: env tests are #[serial]
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env tests are #[serial]
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_delay, Duration::from_secs(61));
        assert_eq!(config.filename_prefix, "test.");
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_partial_override() {
        let config = HarnessConfig::from_toml_str(
            r#"
            request_timeout = "2s"
            grace_period = 0
            keep_scenario_dirs = true
            "#,
        )
        .unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.grace_period, Duration::ZERO);
        assert!(config.keep_scenario_dirs);
        assert_eq!(config.status_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_toml_rejects_unknown_and_bad_durations() {
        assert!(HarnessConfig::from_toml_str("request_timout = \"1s\"").is_err());
        assert!(HarnessConfig::from_toml_str("request_timeout = \"soon\"").is_err());
    }

    #[test]
    fn test_toml_round_trip_uses_humantime() {
        let text = toml::to_string(&HarnessConfig::default()).unwrap();
        assert!(text.contains("retry_delay = \"1m 1s\""));
        assert_eq!(
            HarnessConfig::from_toml_str(&text).unwrap(),
            HarnessConfig::default()
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HarnessConfig::default();
        config.drain_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.status_poll_interval = Duration::from_secs(30);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("status_poll_interval"));

        let mut config = HarnessConfig::default();
        config.filename_prefix = "../escape".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        cleanup_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "request_timeout = \"3s\"\nretry_delay = \"90s\"\n").unwrap();

        set_env("DLS_CONFIG", path.to_str().unwrap());
        set_env("DLS_REQUEST_TIMEOUT", "5s");
        set_env("DLS_KEEP_SCENARIO_DIRS", "yes");

        let config = HarnessConfig::load().unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_delay, Duration::from_secs(90));
        assert!(config.keep_scenario_dirs);
        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_env_errors_are_reported_together() {
        cleanup_env();
        set_env("DLS_REQUEST_TIMEOUT", "forever");
        set_env("DLS_RETRY_DELAY", "later");

        let err = HarnessConfig::load().unwrap_err().to_string();
        assert!(err.contains("DLS_REQUEST_TIMEOUT"));
        assert!(err.contains("DLS_RETRY_DELAY"));
        cleanup_env();
    }

    #[test]
    #[serial]
    fn test_missing_config_file_is_an_error() {
        cleanup_env();
        set_env("DLS_CONFIG", "/nonexistent/dls/harness.toml");
        let err = HarnessConfig::load().unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read harness config"));
        cleanup_env();
    }
}
