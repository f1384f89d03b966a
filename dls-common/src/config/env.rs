//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `DLS_` environment variables with
//! validation, error collection, and source tracking.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value} ({reason})")]
    InvalidDuration {
        var: String,
        value: String,
        reason: String,
    },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the DLS_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "DLS_",
            errors: Vec::new(),
        }
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match parse_bool(&value) {
                    Some(parsed) => parsed,
                    None => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a duration value with default.
    ///
    /// Accepts humantime forms (`250ms`, `10s`, `1m 30s`) and bare integers,
    /// which are read as milliseconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match parse_duration(&value) {
                Ok(duration) => Sourced::from_env(duration, var_name),
                Err(reason) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                        reason,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// An unset or empty variable reads as `None`.
    fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Get an optional path (None if not set or empty).
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let value = self.get_optional_string(name);
        if value.source == ConfigSource::Environment {
            value.map(|v| v.map(PathBuf::from))
        } else {
            Sourced::default_value(None)
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Parse a duration in humantime form, or bare milliseconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(trimmed).map_err(|err| err.to_string())
}
