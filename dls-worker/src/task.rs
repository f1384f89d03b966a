//! One attempt at fetching one download.
//!
//! A task marks its row `RUNNING`, fetches the URI, and commits exactly one
//! outcome: success with the file on disk, a parked retry, or a terminal
//! failure status.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dls_common::{
    CONNECTIVITY_SERVICE, Clock, DownloadId, DownloadRow, DownloadStatus, NOTIFICATION_SERVICE,
    POWER_SERVICE, ScenarioEnvironment,
};
use tracing::{debug, error, info, info_span, warn};
use ureq::Agent;

use crate::error::DownloadError;
use crate::policy::{Decision, RetryPolicy};

pub(crate) const USER_AGENT: &str = concat!("dls-worker/", env!("CARGO_PKG_VERSION"));

/// The parts of a response the worker keeps.
#[derive(Debug)]
struct Fetched {
    status: u16,
    retry_after: Option<String>,
    mime_type: Option<String>,
    etag: Option<String>,
    body: Option<Vec<u8>>,
}

pub(crate) struct DownloadTask {
    id: DownloadId,
    environment: Arc<ScenarioEnvironment>,
    clock: Arc<dyn Clock>,
    agent: Agent,
    policy: RetryPolicy,
}

impl DownloadTask {
    pub(crate) fn new(
        id: DownloadId,
        environment: Arc<ScenarioEnvironment>,
        clock: Arc<dyn Clock>,
        agent: Agent,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            environment,
            clock,
            agent,
            policy,
        }
    }

    /// Run the attempt to completion, recording any failure on the row.
    pub(crate) fn run(&self) {
        let span = info_span!("download", id = %self.id);
        let _enter = span.enter();

        match self.execute() {
            Ok(status) => info!(%status, "download attempt finished"),
            Err(DownloadError::Store(error)) => warn!(%error, "download row vanished mid-attempt"),
            Err(error) => {
                let status = error.status();
                error!(%error, %status, "download failed");
                if let Err(store_error) = self.fail(status, &error.to_string()) {
                    warn!(error = %store_error, "could not record download failure");
                }
            }
        }
    }

    fn execute(&self) -> Result<DownloadStatus, DownloadError> {
        let now = self.clock.now_millis();
        let row = self
            .environment
            .state_store()
            .update(self.id, |row| {
                row.status = DownloadStatus::RUNNING;
                row.last_modified_ms = now;
            })?;

        // Held for the whole transfer.
        let _wake_lock = self.environment.service(POWER_SERVICE)?;
        let network = self.environment.service(CONNECTIVITY_SERVICE)?;
        debug!(uri = %row.uri, network_origin = ?network.origin(), "fetching");

        let fetched = match self.fetch(&row.uri) {
            Ok(fetched) => fetched,
            Err(error @ DownloadError::Transport { .. }) => {
                warn!(%error, num_failed = row.num_failed, "transport failure");
                let decision = self.policy.transport_failure(row.num_failed);
                return self.settle(&row, decision, None, &error.to_string());
            }
            Err(error) => return Err(error),
        };

        debug!(http_status = fetched.status, retry_after = ?fetched.retry_after, "response received");
        let decision = self.policy.decide(
            fetched.status,
            fetched.retry_after.as_deref(),
            row.num_failed,
        );
        let message = format!("HTTP {}", fetched.status);
        self.settle(&row, decision, Some(fetched), &message)
    }

    fn fetch(&self, uri: &str) -> Result<Fetched, DownloadError> {
        let mut response = self
            .agent
            .get(uri)
            .header("user-agent", USER_AGENT)
            .call()
            .map_err(|source| DownloadError::Transport {
                uri: uri.to_string(),
                source,
            })?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let status = response.status().as_u16();
        let retry_after = header("retry-after");
        let mime_type = header("content-type");
        let etag = header("etag");

        let body = if status == 200 {
            let bytes = response
                .body_mut()
                .read_to_vec()
                .map_err(|source| DownloadError::Body {
                    uri: uri.to_string(),
                    source,
                })?;
            Some(bytes)
        } else {
            None
        };

        Ok(Fetched {
            status,
            retry_after,
            mime_type,
            etag,
            body,
        })
    }

    fn settle(
        &self,
        row: &DownloadRow,
        decision: Decision,
        fetched: Option<Fetched>,
        message: &str,
    ) -> Result<DownloadStatus, DownloadError> {
        match (decision, fetched) {
            (Decision::Success, Some(fetched)) => self.complete(row, fetched),
            (Decision::Success, None) => self.fail(DownloadStatus::UNKNOWN_ERROR, "no response"),
            (Decision::Retry { delay }, _) => self.park(delay, message),
            (Decision::Fail(status), _) => self.fail(status, message),
        }
    }

    fn complete(&self, row: &DownloadRow, fetched: Fetched) -> Result<DownloadStatus, DownloadError> {
        let body = fetched.body.unwrap_or_default();
        let path = self.environment.file_path(&file_name(row));
        write_file(&path, &body)?;

        let now = self.clock.now_millis();
        let length = u64::try_from(body.len()).unwrap_or(u64::MAX);
        self.environment.state_store().update(self.id, |row| {
            row.status = DownloadStatus::SUCCESS;
            row.file_path = Some(path.clone());
            row.mime_type = fetched.mime_type;
            row.etag = fetched.etag;
            row.total_bytes = Some(length);
            row.current_bytes = length;
            row.num_failed = 0;
            row.retry_after_ms = None;
            row.error_message = None;
            row.last_modified_ms = now;
        })?;

        match self.environment.service(NOTIFICATION_SERVICE) {
            Ok(notifications) => {
                notifications.post(&format!("Download complete: {}", path.display()));
            }
            Err(error) => warn!(%error, "completion notification not posted"),
        }
        Ok(DownloadStatus::SUCCESS)
    }

    fn park(&self, delay: Duration, message: &str) -> Result<DownloadStatus, DownloadError> {
        let now = self.clock.now_millis();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let row = self.environment.state_store().update(self.id, |row| {
            row.status = DownloadStatus::RUNNING_PAUSED;
            row.num_failed = row.num_failed.saturating_add(1);
            row.retry_after_ms = Some(delay_ms);
            row.next_action_at_ms = now.saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX));
            row.last_modified_ms = now;
            row.error_message = Some(message.to_string());
        })?;
        info!(
            num_failed = row.num_failed,
            next_action_at_ms = row.next_action_at_ms,
            "download paused for retry"
        );
        Ok(DownloadStatus::RUNNING_PAUSED)
    }

    fn fail(&self, status: DownloadStatus, message: &str) -> Result<DownloadStatus, DownloadError> {
        let now = self.clock.now_millis();
        self.environment.state_store().update(self.id, |row| {
            row.status = status;
            row.retry_after_ms = None;
            row.last_modified_ms = now;
            row.error_message = Some(message.to_string());
        })?;
        Ok(status)
    }
}

/// Local name for a row: the requester's hint if usable, else `download-<id>`.
pub(crate) fn file_name(row: &DownloadRow) -> String {
    row.file_hint
        .as_deref()
        .map(|hint| hint.replace(['/', '\\'], "_"))
        .filter(|hint| !hint.is_empty() && hint != "." && hint != "..")
        .unwrap_or_else(|| format!("download-{}", row.id))
}

/// Write through a `.part` file so readers never see a partial body.
fn write_file(path: &Path, body: &[u8]) -> Result<(), DownloadError> {
    let to_error = |source| DownloadError::File {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_error)?;
    }
    let mut partial = PathBuf::from(path);
    partial.as_mut_os_string().push(".part");
    std::fs::write(&partial, body).map_err(to_error)?;
    std::fs::rename(&partial, path).map_err(to_error)
}
