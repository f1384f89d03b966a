//! Deadline-bounded waiting for a download to reach a status.
//!
//! [`StatusWaiter::wait_for_state`] alternates between reading the status
//! and sleeping on the [`ChangeNotifier`]. Each sleep is capped at the poll
//! interval, so a missed or coalesced signal costs at most one interval.
//! A terminal status other than the expected one fails at once. A status
//! that simply never arrives fails with a timeout, and never before the
//! deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dls_common::{DownloadId, DownloadStatus, ScenarioEnvironment, StateStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::notifier::ChangeNotifier;
use crate::peer::MockNetworkPeer;

/// Read access to the status of the download under test.
pub trait StatusReader {
    fn current_status(&self) -> DownloadStatus;

    /// Whether `status` is final, so waiting for anything else is futile.
    fn is_terminal(&self, status: DownloadStatus) -> bool;
}

/// Reads one row of a [`StateStore`].
///
/// A row that no longer exists reads as `UNKNOWN_ERROR`, which is terminal.
#[derive(Debug, Clone)]
pub struct StoreStatusReader {
    store: Arc<StateStore>,
    id: DownloadId,
}

impl StoreStatusReader {
    pub fn new(store: Arc<StateStore>, id: DownloadId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }
}

impl StatusReader for StoreStatusReader {
    fn current_status(&self) -> DownloadStatus {
        self.store.get(self.id).map_or_else(
            || {
                warn!(id = %self.id, "download row missing");
                DownloadStatus::UNKNOWN_ERROR
            },
            |row| row.status,
        )
    }

    fn is_terminal(&self, status: DownloadStatus) -> bool {
        status.is_completed()
    }
}

/// Source of asynchronous faults checked on every poll.
pub trait FaultCheck: Send + Sync {
    fn check_faults(&self) -> HarnessResult<()>;
}

impl FaultCheck for MockNetworkPeer {
    fn check_faults(&self) -> HarnessResult<()> {
        Ok(self.check_for_exceptions()?)
    }
}

impl FaultCheck for ScenarioEnvironment {
    fn check_faults(&self) -> HarnessResult<()> {
        Ok(self.check_configuration()?)
    }
}

/// A successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub status: DownloadStatus,
    pub elapsed: Duration,
    /// Status reads performed, including the successful one.
    pub polls: u32,
}

pub struct StatusWaiter {
    notifier: Arc<ChangeNotifier>,
    poll_interval: Duration,
    fault_checks: Vec<Arc<dyn FaultCheck>>,
}

impl StatusWaiter {
    pub fn new(notifier: Arc<ChangeNotifier>, poll_interval: Duration) -> Self {
        Self {
            notifier,
            poll_interval,
            fault_checks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_fault_check(mut self, check: Arc<dyn FaultCheck>) -> Self {
        self.fault_checks.push(check);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until `reader` reports `expected`, failing at `timeout`.
    pub fn wait_for_state(
        &self,
        reader: &dyn StatusReader,
        expected: DownloadStatus,
        timeout: Duration,
    ) -> HarnessResult<WaitOutcome> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut polls = 0u32;

        loop {
            if polls > 0 {
                self.run_fault_checks()?;
            }
            let status = reader.current_status();
            polls += 1;
            debug!(%status, %expected, polls, "polled download status");
            self.judge(reader, status, expected, start, deadline, polls)?;
            if status == expected {
                return Ok(self.success(status, start, polls));
            }

            let wake_at = deadline.min(Instant::now() + self.poll_interval);
            self.notifier.await_change(wake_at);

            if Instant::now() >= deadline {
                self.run_fault_checks()?;
                let status = reader.current_status();
                polls += 1;
                self.judge(reader, status, expected, start, deadline, polls)?;
                if status == expected {
                    return Ok(self.success(status, start, polls));
                }
                let elapsed = start.elapsed();
                warn!(%status, %expected, ?elapsed, polls, "timed out waiting for status");
                return Err(HarnessError::StatusTimeout {
                    expected,
                    observed: status,
                    elapsed,
                    timeout,
                });
            }
        }
    }

    /// Fail on a terminal status that is not the expected one.
    fn judge(
        &self,
        reader: &dyn StatusReader,
        status: DownloadStatus,
        expected: DownloadStatus,
        start: Instant,
        deadline: Instant,
        polls: u32,
    ) -> HarnessResult<()> {
        if status != expected && reader.is_terminal(status) {
            let elapsed = start.elapsed();
            warn!(%status, %expected, ?elapsed, polls, "download reached unexpected terminal status");
            return Err(HarnessError::UnexpectedTerminalState {
                expected,
                observed: status,
                elapsed,
                remaining: deadline.saturating_duration_since(Instant::now()),
            });
        }
        Ok(())
    }

    fn success(&self, status: DownloadStatus, start: Instant, polls: u32) -> WaitOutcome {
        let outcome = WaitOutcome {
            status,
            elapsed: start.elapsed(),
            polls,
        };
        info!(%status, elapsed = ?outcome.elapsed, polls, "reached expected status");
        outcome
    }

    fn run_fault_checks(&self) -> HarnessResult<()> {
        self.fault_checks
            .iter()
            .try_for_each(|check| check.check_faults())
    }
}

impl std::fmt::Debug for StatusWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWaiter")
            .field("poll_interval", &self.poll_interval)
            .field("fault_checks", &self.fault_checks.len())
            .finish()
    }
}
