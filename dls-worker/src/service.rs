//! The background download service.
//!
//! `start` marks an update as pending and makes sure exactly one update
//! thread exists. The update thread scans the store for rows that are ready,
//! hands each one to its own task thread, and exits (clearing its handle)
//! once no further update is pending. Task threads hold an [`ActivityGuard`]
//! for their whole lifetime, so "no update thread and no active task" is a
//! faithful quiescence signal.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dls_common::{
    ActivityGuard, ActivityTracker, Clock, ComponentName, DownloadId, DownloadRow, DownloadStatus,
    Filter, ScenarioEnvironment, WorkRequest, Worker, WorkerContext, WorkerError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};
use ureq::Agent;

use crate::policy::RetryPolicy;
use crate::task::DownloadTask;

/// Component name under which the service is launched.
pub const DOWNLOAD_SERVICE: &str = "dls_worker::DownloadService";

const UPDATE_THREAD_NAME: &str = "dls-update";

pub fn download_service_component() -> ComponentName {
    ComponentName::new(DOWNLOAD_SERVICE)
}

/// Tunables for the download service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Overall deadline for one HTTP exchange.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct UpdateState {
    pending: bool,
    thread: Option<JoinHandle<()>>,
}

struct Inner {
    environment: Arc<ScenarioEnvironment>,
    clock: Arc<dyn Clock>,
    agent: Agent,
    config: ServiceConfig,
    update: Mutex<UpdateState>,
    in_flight: Mutex<HashSet<DownloadId>>,
    activity: ActivityTracker,
    shut_down: AtomicBool,
}

pub struct DownloadService {
    inner: Arc<Inner>,
}

impl DownloadService {
    pub fn new(context: WorkerContext) -> Self {
        Self::with_config(context, ServiceConfig::default())
    }

    pub fn with_config(context: WorkerContext, config: ServiceConfig) -> Self {
        // Proxy variables from the host environment are ignored.
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .proxy(None)
            .timeout_global(Some(config.request_timeout))
            .build()
            .into();

        Self {
            inner: Arc::new(Inner {
                environment: context.environment,
                clock: context.clock,
                agent,
                config,
                update: Mutex::new(UpdateState::default()),
                in_flight: Mutex::new(HashSet::new()),
                activity: ActivityTracker::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Number of task threads currently running.
    pub fn active_tasks(&self) -> usize {
        self.inner.activity.active()
    }

    /// Earliest clock time at which a paused download becomes ready again.
    pub fn next_wakeup_ms(&self) -> Option<i64> {
        self.inner
            .environment
            .state_store()
            .query(&Filter::Status(DownloadStatus::RUNNING_PAUSED))
            .iter()
            .map(|row| row.next_action_at_ms)
            .min()
    }
}

impl Worker for DownloadService {
    fn start(&self, request: &WorkRequest) -> Result<(), WorkerError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(WorkerError::ShutDown);
        }
        debug!(
            component = %request.component,
            download = ?request.download,
            "start requested"
        );

        let mut state = lock(&self.inner.update);
        state.pending = true;
        if state.thread.is_none() {
            let inner = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(UPDATE_THREAD_NAME.to_string())
                .spawn(move || inner.run_update_loop())
                .map_err(|source| WorkerError::SpawnFailed {
                    name: UPDATE_THREAD_NAME.to_string(),
                    source,
                })?;
            state.thread = Some(handle);
            debug!("update thread spawned");
        }
        Ok(())
    }

    fn has_update_thread(&self) -> bool {
        lock(&self.inner.update).thread.is_some()
    }

    fn is_quiescent(&self) -> bool {
        !self.has_update_thread() && self.inner.activity.is_idle()
    }

    fn shutdown(&self) -> Result<(), WorkerError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = lock(&self.inner.update).thread.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| WorkerError::ThreadPanicked(UPDATE_THREAD_NAME.to_string()))?;
        }
        info!(
            active_tasks = self.inner.activity.active(),
            "download service shut down"
        );
        Ok(())
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!(%error, "download service did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("update_thread", &self.has_update_thread())
            .field("active_tasks", &self.active_tasks())
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Inner {
    fn run_update_loop(self: Arc<Self>) {
        loop {
            {
                let mut state = lock(&self.update);
                if !state.pending || self.shut_down.load(Ordering::SeqCst) {
                    state.thread = None;
                    debug!("update thread exiting");
                    return;
                }
                state.pending = false;
            }
            self.update_from_store();
        }
    }

    fn update_from_store(self: &Arc<Self>) {
        let now = self.clock.now_millis();
        for row in self.environment.state_store().query(&Filter::Active) {
            if !is_ready(&row, now) {
                trace!(
                    id = %row.id,
                    status = %row.status,
                    next_action_at_ms = row.next_action_at_ms,
                    "download not ready"
                );
                continue;
            }
            if !lock(&self.in_flight).insert(row.id) {
                continue;
            }
            if let Err(source) = self.spawn_task(row.id) {
                lock(&self.in_flight).remove(&row.id);
                error!(id = %row.id, error = %source, "failed to spawn download task");
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, id: DownloadId) -> std::io::Result<()> {
        let guard = self.activity.begin();
        let task = DownloadTask::new(
            id,
            Arc::clone(&self.environment),
            Arc::clone(&self.clock),
            self.agent.clone(),
            self.config.retry,
        );
        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("dls-download-{id}"))
            .spawn(move || {
                let _in_flight = InFlight {
                    inner: &inner,
                    id,
                    _guard: guard,
                };
                task.run();
            })?;
        Ok(())
    }
}

/// Releases a row's in-flight slot before the activity count drops, even
/// when the task panics.
struct InFlight<'a> {
    inner: &'a Inner,
    id: DownloadId,
    _guard: ActivityGuard,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.id);
    }
}

fn is_ready(row: &DownloadRow, now_ms: i64) -> bool {
    match row.status {
        DownloadStatus::PENDING | DownloadStatus::RUNNING => true,
        DownloadStatus::RUNNING_PAUSED => row.next_action_at_ms <= now_ms,
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dls_common::{
        EnvironmentConfig, FakeClock, NewDownload, StateStore, SystemServices,
    };
    use std::time::Instant;

    fn context(data_dir: &std::path::Path) -> WorkerContext {
        let environment = ScenarioEnvironment::new(
            EnvironmentConfig::new(data_dir, download_service_component()),
            Arc::new(StateStore::new()),
            Arc::new(SystemServices),
        );
        WorkerContext::new(Arc::new(environment), Arc::new(FakeClock::new()))
    }

    fn wait_quiescent(service: &DownloadService) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !service.is_quiescent() {
            assert!(Instant::now() < deadline, "service never quiesced");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_is_ready() {
        let store = StateStore::new();
        let id = store.insert(NewDownload::new("http://127.0.0.1/x"), 0);
        let mut row = store.get(id).unwrap();
        assert!(is_ready(&row, 0));

        row.status = DownloadStatus::RUNNING_PAUSED;
        row.next_action_at_ms = 1_000;
        assert!(!is_ready(&row, 999));
        assert!(is_ready(&row, 1_000));

        row.status = DownloadStatus::SUCCESS;
        assert!(!is_ready(&row, i64::MAX));
    }

    #[test]
    fn test_update_thread_exits_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let service = DownloadService::new(context(dir.path()));
        assert!(service.is_quiescent());

        service
            .start(&WorkRequest::update(download_service_component()))
            .unwrap();
        wait_quiescent(&service);
        assert!(!service.has_update_thread());
        assert_eq!(service.active_tasks(), 0);
    }

    #[test]
    fn test_start_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = DownloadService::new(context(dir.path()));
        service.shutdown().unwrap();
        service.shutdown().unwrap();

        let err = service
            .start(&WorkRequest::update(download_service_component()))
            .unwrap_err();
        assert!(matches!(err, WorkerError::ShutDown));
    }

    #[test]
    fn test_unreachable_peer_parks_download() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let store = Arc::clone(ctx.environment.state_store());

        // Bind then drop so the port is very likely closed.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let id = store.insert(NewDownload::new(format!("http://127.0.0.1:{port}/gone")), 0);

        let service = DownloadService::new(ctx);
        service
            .start(&WorkRequest::for_download(download_service_component(), id))
            .unwrap();
        wait_quiescent(&service);

        let row = store.get(id).unwrap();
        assert_eq!(row.status, DownloadStatus::RUNNING_PAUSED);
        assert_eq!(row.num_failed, 1);
        assert_eq!(service.next_wakeup_ms(), Some(30_000));
    }

    #[test]
    fn test_paused_download_not_retried_before_wakeup() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let store = Arc::clone(ctx.environment.state_store());
        let id = store.insert(NewDownload::new("http://127.0.0.1:9/never"), 0);
        store
            .update(id, |row| {
                row.status = DownloadStatus::RUNNING_PAUSED;
                row.next_action_at_ms = 60_000;
            })
            .unwrap();

        let service = DownloadService::new(ctx);
        service
            .start(&WorkRequest::update(download_service_component()))
            .unwrap();
        wait_quiescent(&service);

        assert_eq!(store.get(id).unwrap().num_failed, 0);
        assert_eq!(
            store.get(id).unwrap().status,
            DownloadStatus::RUNNING_PAUSED
        );
    }
}
