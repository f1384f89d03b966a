//! Best-effort wait for worker threads before teardown.
//!
//! Tearing down the environment while a worker thread is still inside a
//! store update makes that thread fail against a half-destroyed scenario,
//! and the failure can land in whichever test runs next. [`ThreadDrain`]
//! polls the worker's quiescence signal (no update thread, no in-flight
//! task) for a bounded time, then sleeps a short grace period for work the
//! signal cannot see, such as a task thread between dropping its activity
//! guard and actually exiting.
//!
//! This is still timing dependent. A worker that does not quiesce within
//! the drain timeout is logged and reported, not failed, and the scenario
//! carries on tearing down. If a suite shows cross-test interference, look
//! for `worker did not quiesce` in the logs first.

use std::thread;
use std::time::{Duration, Instant};

use dls_common::Worker;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::HarnessConfig;

/// What a drain observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Whether the worker reported quiescence before the timeout.
    pub quiesced: bool,
    /// Time spent polling, excluding the grace period.
    pub waited: Duration,
    pub polls: u32,
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadDrain {
    timeout: Duration,
    poll_interval: Duration,
    grace_period: Duration,
}

impl Default for ThreadDrain {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }
}

impl ThreadDrain {
    pub fn new(timeout: Duration, poll_interval: Duration, grace_period: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            grace_period,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.drain_timeout,
            config.drain_poll_interval,
            config.grace_period,
        )
    }

    pub fn drain(&self, worker: &dyn Worker) -> DrainReport {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut polls = 0u32;

        let quiesced = loop {
            polls += 1;
            if worker.is_quiescent() {
                break true;
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        };
        let waited = start.elapsed();

        if quiesced {
            debug!(?waited, polls, "worker quiesced");
        } else {
            warn!(
                ?waited,
                polls,
                update_thread = worker.has_update_thread(),
                "worker did not quiesce; tearing down anyway"
            );
        }

        thread::sleep(self.grace_period);
        DrainReport {
            quiesced,
            waited,
            polls,
            grace_period: self.grace_period,
        }
    }
}
