//! Source tracking for configuration values.

use serde::{Deserialize, Serialize};

/// Where a configuration value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// Loaded from a configuration file.
    File,
    /// Read from a `DLS_*` environment variable.
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "file"),
            Self::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name when the value came from the environment.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, env_var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(env_var.into()),
        }
    }

    /// True unless the value is a built-in default.
    pub fn is_overridden(&self) -> bool {
        self.source != ConfigSource::Default
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
        }
    }
}
