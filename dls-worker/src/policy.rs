//! Response classification and retry scheduling.

use std::time::Duration;

use dls_common::DownloadStatus;
use serde::{Deserialize, Serialize};

/// What the worker does with a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Body received; write it out.
    Success,
    /// Park the download as `RUNNING_PAUSED` and try again after `delay`.
    Retry { delay: Duration },
    /// Give up with a terminal status.
    Fail(DownloadStatus),
}

/// Retry limits for retryable failures (503 and transport errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before a retryable error becomes terminal.
    pub max_retries: u32,
    /// Lower clamp for a server supplied `Retry-After`.
    pub min_retry_after: Duration,
    /// Upper clamp for a server supplied `Retry-After` and for backoff.
    pub max_retry_after: Duration,
    /// Backoff base used when the server gives no `Retry-After`.
    pub first_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            min_retry_after: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(24 * 60 * 60),
            first_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Classify an HTTP status. `num_failed` counts earlier retryable failures.
    pub fn decide(&self, http_status: u16, retry_after: Option<&str>, num_failed: u32) -> Decision {
        match http_status {
            200 => Decision::Success,
            503 if num_failed < self.max_retries => Decision::Retry {
                delay: retry_after
                    .and_then(|value| self.parse_retry_after(value))
                    .unwrap_or_else(|| self.backoff(num_failed)),
            },
            400..=599 => Decision::Fail(DownloadStatus(i32::from(http_status))),
            _ => Decision::Fail(DownloadStatus::UNHANDLED_HTTP_CODE),
        }
    }

    /// Classify a failure to reach the server at all.
    pub fn transport_failure(&self, num_failed: u32) -> Decision {
        if num_failed < self.max_retries {
            Decision::Retry {
                delay: self.backoff(num_failed),
            }
        } else {
            Decision::Fail(DownloadStatus::HTTP_EXCEPTION)
        }
    }

    /// `first_delay * 2^num_failed`, capped at `max_retry_after`.
    pub fn backoff(&self, num_failed: u32) -> Duration {
        let factor = 1u32.checked_shl(num_failed).unwrap_or(u32::MAX);
        self.first_delay
            .checked_mul(factor)
            .map_or(self.max_retry_after, |delay| delay.min(self.max_retry_after))
    }

    /// Parse delta-seconds and clamp into `[min_retry_after, max_retry_after]`.
    pub fn parse_retry_after(&self, value: &str) -> Option<Duration> {
        let seconds: u64 = value.trim().parse().ok()?;
        Some(
            Duration::from_secs(seconds)
                .clamp(self.min_retry_after, self.max_retry_after),
        )
    }
}
