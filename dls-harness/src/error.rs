//! Harness error taxonomy.

use std::time::Duration;

use dls_common::{DownloadStatus, EnvironmentError, StoreError, WorkerError};
use serde::Serialize;
use thiserror::Error;

use crate::peer::PeerError;

/// Coarse classification of a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A deadline passed without the awaited event.
    Timeout,
    /// The download ended in a terminal status other than the one awaited.
    UnexpectedTerminalState,
    /// The scenario or its environment was set up wrong.
    Configuration,
    /// The mock peer recorded a fault.
    Peer,
    /// A scenario assertion did not hold.
    Assertion,
    /// IO, worker lifecycle or store failures.
    Infrastructure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::UnexpectedTerminalState => write!(f, "unexpected_terminal_state"),
            Self::Configuration => write!(f, "configuration"),
            Self::Peer => write!(f, "peer"),
            Self::Assertion => write!(f, "assertion"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(
        "Timed out after {elapsed:?} (limit {timeout:?}) waiting for status {expected}; last observed {observed}"
    )]
    StatusTimeout {
        expected: DownloadStatus,
        observed: DownloadStatus,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("No request reached the mock peer within {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error(
        "Download stopped at terminal status {observed} while waiting for {expected} ({elapsed:?} elapsed, {remaining:?} remaining)"
    )]
    UnexpectedTerminalState {
        expected: DownloadStatus,
        observed: DownloadStatus,
        elapsed: Duration,
        remaining: Duration,
    },

    #[error("Configuration error: {0}")]
    Configuration(#[from] EnvironmentError),

    #[error("Invalid harness configuration: {0}")]
    InvalidConfig(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Mock peer fault: {0}")]
    Peer(#[from] PeerError),

    #[error("Request {method} {path} does not target expected prefix {expected}")]
    UnexpectedRequest {
        method: String,
        path: String,
        expected: String,
    },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StatusTimeout { .. } | Self::RequestTimeout { .. } => ErrorKind::Timeout,
            Self::UnexpectedTerminalState { .. } => ErrorKind::UnexpectedTerminalState,
            Self::Configuration(_) | Self::InvalidConfig(_) | Self::Setup(_) => {
                ErrorKind::Configuration
            }
            Self::Peer(_) | Self::UnexpectedRequest { .. } => ErrorKind::Peer,
            Self::AssertionFailed(_) => ErrorKind::Assertion,
            Self::Io(_) | Self::Worker(_) | Self::Store(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_both_statuses() {
        let err = HarnessError::StatusTimeout {
            expected: DownloadStatus::SUCCESS,
            observed: DownloadStatus::RUNNING_PAUSED,
            elapsed: Duration::from_millis(1500),
            timeout: Duration::from_millis(1500),
        };
        let message = err.to_string();
        assert!(message.contains("200"));
        assert!(message.contains("193"));
        assert!(message.contains("1.5s"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_kinds() {
        let terminal = HarnessError::UnexpectedTerminalState {
            expected: DownloadStatus::SUCCESS,
            observed: DownloadStatus::NOT_FOUND,
            elapsed: Duration::ZERO,
            remaining: Duration::from_secs(10),
        };
        assert_eq!(terminal.kind(), ErrorKind::UnexpectedTerminalState);
        assert!(!terminal.is_timeout());

        let config = HarnessError::from(EnvironmentError::BlockedService("location".into()));
        assert_eq!(config.kind(), ErrorKind::Configuration);

        let peer = HarnessError::from(PeerError::InvalidStatus(42));
        assert_eq!(peer.kind(), ErrorKind::Peer);

        let io = HarnessError::from(std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Infrastructure);
        assert_eq!(ErrorKind::UnexpectedTerminalState.to_string(), "unexpected_terminal_state");
    }
}
