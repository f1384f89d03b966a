//! The capability a background worker exposes to the harness.
//!
//! Besides `start`, a worker publishes a quiescence signal: whether its
//! primary update thread is alive and whether any per-task work is in
//! flight. [`ActivityTracker`] is the bookkeeping a worker uses to emit the
//! second half of that signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::clock::Clock;
use crate::environment::ScenarioEnvironment;
use crate::types::WorkRequest;

/// Failures while starting or stopping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker has been shut down")]
    ShutDown,

    #[error("failed to spawn worker thread '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// Everything a worker needs from the scenario, passed into its constructor.
#[derive(Clone)]
pub struct WorkerContext {
    pub environment: Arc<ScenarioEnvironment>,
    pub clock: Arc<dyn Clock>,
}

impl WorkerContext {
    pub fn new(environment: Arc<ScenarioEnvironment>, clock: Arc<dyn Clock>) -> Self {
        Self { environment, clock }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("environment", &self.environment)
            .field("now_ms", &self.clock.now_millis())
            .finish()
    }
}

/// A background worker the harness can start, observe and stop.
pub trait Worker: Send + Sync {
    /// Launch the worker or nudge an already running one.
    fn start(&self, request: &WorkRequest) -> Result<(), WorkerError>;

    /// Whether the primary update thread currently exists.
    fn has_update_thread(&self) -> bool;

    /// True when no update thread exists and no task is in flight.
    fn is_quiescent(&self) -> bool;

    /// Stop accepting work and join whatever can be joined.
    fn shutdown(&self) -> Result<(), WorkerError>;
}

/// Counts in-flight tasks so a worker can report quiescence.
#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    active: Arc<AtomicUsize>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one task as started; it ends when the guard drops.
    pub fn begin(&self) -> ActivityGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }
}

/// Keeps one task counted as active until dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
