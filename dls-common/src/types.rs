//! Common types used across the download sync harness components.

use serde::{Deserialize, Serialize};

/// Unique identifier for a download row in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DownloadId(pub u64);

impl DownloadId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DownloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a download as persisted by the worker.
///
/// Values follow the HTTP-flavoured numbering used by download engines:
/// 1xx codes are in-flight, 2xx is success, 4xx/5xx are permanent failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadStatus(pub i32);

impl DownloadStatus {
    /// Queued, waiting for the worker to pick it up.
    pub const PENDING: Self = Self(190);
    /// Transfer in progress.
    pub const RUNNING: Self = Self(192);
    /// Transfer interrupted, worker will retry later.
    pub const RUNNING_PAUSED: Self = Self(193);
    /// Transfer completed and the file is on disk.
    pub const SUCCESS: Self = Self(200);
    pub const BAD_REQUEST: Self = Self(400);
    pub const NOT_FOUND: Self = Self(404);
    pub const CANCELED: Self = Self(490);
    pub const UNKNOWN_ERROR: Self = Self(491);
    pub const FILE_ERROR: Self = Self(492);
    pub const UNHANDLED_HTTP_CODE: Self = Self(494);
    pub const HTTP_DATA_ERROR: Self = Self(495);
    pub const HTTP_EXCEPTION: Self = Self(496);
    pub const SERVICE_UNAVAILABLE: Self = Self(503);

    pub fn code(&self) -> i32 {
        self.0
    }

    /// 1xx: the worker still owns this download.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.0)
    }

    /// Terminal classification: success or permanent failure.
    pub fn is_completed(&self) -> bool {
        self.is_success() || self.is_error()
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match *self {
            Self::PENDING => "pending",
            Self::RUNNING => "running",
            Self::RUNNING_PAUSED => "running_paused",
            Self::SUCCESS => "success",
            Self::CANCELED => "canceled",
            Self::UNKNOWN_ERROR => "unknown_error",
            Self::FILE_ERROR => "file_error",
            Self::UNHANDLED_HTTP_CODE => "unhandled_http_code",
            Self::HTTP_DATA_ERROR => "http_data_error",
            Self::HTTP_EXCEPTION => "http_exception",
            s if s.is_success() => "success",
            s if s.is_error() => "error",
            _ => "unknown",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.0, self.label())
    }
}

/// Logical name of a launchable component (the worker service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName(pub String);

impl ComponentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request to start (or nudge) a background component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Component the request is addressed to.
    pub component: ComponentName,
    /// Download that triggered the request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadId>,
}

impl WorkRequest {
    /// Plain "re-scan the store" request, like starting a service with no extras.
    pub fn update(component: ComponentName) -> Self {
        Self {
            component,
            download: None,
        }
    }

    pub fn for_download(component: ComponentName, download: DownloadId) -> Self {
        Self {
            component,
            download: Some(download),
        }
    }
}
