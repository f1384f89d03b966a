//! Errors raised while executing one download attempt.

use std::path::PathBuf;

use dls_common::{DownloadStatus, EnvironmentError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {uri} failed: {source}")]
    Transport {
        uri: String,
        #[source]
        source: ureq::Error,
    },

    #[error("failed to read response body from {uri}: {source}")]
    Body {
        uri: String,
        #[source]
        source: ureq::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

impl DownloadError {
    /// Terminal status recorded on the row when this error ends a download.
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Transport { .. } => DownloadStatus::HTTP_EXCEPTION,
            Self::Body { .. } => DownloadStatus::HTTP_DATA_ERROR,
            Self::File { .. } => DownloadStatus::FILE_ERROR,
            Self::Store(_) | Self::Environment(_) => DownloadStatus::UNKNOWN_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dls_common::DownloadId;

    #[test]
    fn test_status_mapping() {
        let file = DownloadError::File {
            path: PathBuf::from("/tmp/test.x"),
            source: std::io::Error::other("disk full"),
        };
        assert_eq!(file.status(), DownloadStatus::FILE_ERROR);
        assert!(file.to_string().contains("/tmp/test.x"));

        let store = DownloadError::from(StoreError::NotFound(DownloadId(9)));
        assert_eq!(store.status(), DownloadStatus::UNKNOWN_ERROR);

        let env = DownloadError::from(EnvironmentError::BlockedService("power".into()));
        assert_eq!(env.status(), DownloadStatus::UNKNOWN_ERROR);
        assert!(env.to_string().contains("power"));
    }
}
