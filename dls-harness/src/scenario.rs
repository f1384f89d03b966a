//! One download scenario from setup to teardown.
//!
//! [`Scenario`] owns everything a test needs: a fresh state store wired to a
//! [`ChangeNotifier`], a scenario environment with its own data directory, a
//! [`MockNetworkPeer`], a fake clock and the worker under test. Teardown runs
//! in a fixed order: drain the worker, delete downloads, stop the worker,
//! stop the peer, then surface any fault recorded along the way. Dropping a
//! scenario without calling [`Scenario::teardown`] runs the same steps and
//! only logs what goes wrong.
//!
//! ```ignore
//! let scenario = Scenario::builder("ok", download_service_component())
//!     .build(DownloadService::new)?;
//! scenario.enqueue_response(200, "hello world");
//! let id = scenario.insert_download(scenario.server_uri("/file"));
//! scenario.run_until_status(&scenario.status_reader(id), DownloadStatus::SUCCESS)?;
//! scenario.teardown()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dls_common::testing::TestPhase;
use dls_common::{
    AmbientServices, Clock, ComponentName, DOWNLOADS_RESOURCE, DownloadId, DownloadStatus,
    EnvironmentConfig, FakeClock, Filter, LaunchHook, NewDownload, ScenarioEnvironment,
    ServicePolicy, StateStore, SystemClock, SystemServices, WorkRequest, Worker, WorkerContext,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::correlator::RequestCorrelator;
use crate::drain::{DrainReport, ThreadDrain};
use crate::error::{HarnessError, HarnessResult};
use crate::notifier::{ChangeNotifier, NotifierObserver};
use crate::peer::{MockNetworkPeer, MockResponse, RecordedRequest};
use crate::waiter::{FaultCheck, StatusReader, StatusWaiter, StoreStatusReader, WaitOutcome};

pub struct ScenarioBuilder {
    name: String,
    expected_worker: ComponentName,
    config: HarnessConfig,
    store: Option<Arc<StateStore>>,
    ambient: Arc<dyn AmbientServices>,
    policies: Vec<(String, ServicePolicy)>,
    launch_hook: Option<LaunchHook>,
}

impl ScenarioBuilder {
    #[must_use]
    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing store instead of a fresh one. It must be empty.
    #[must_use]
    pub fn store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn ambient_services(mut self, ambient: Arc<dyn AmbientServices>) -> Self {
        self.ambient = ambient;
        self
    }

    /// Override the policy for one ambient service.
    #[must_use]
    pub fn service_policy(mut self, name: impl Into<String>, policy: ServicePolicy) -> Self {
        self.policies.push((name.into(), policy));
        self
    }

    /// Called for every intercepted launch of the expected worker.
    #[must_use]
    pub fn launch_hook(mut self, hook: LaunchHook) -> Self {
        self.launch_hook = Some(hook);
        self
    }

    /// Set everything up and construct the worker from the scenario context.
    pub fn build<W, F>(self, make_worker: F) -> HarnessResult<Scenario<W>>
    where
        W: Worker,
        F: FnOnce(WorkerContext) -> W,
    {
        self.config.validate()?;
        let id = Uuid::new_v4();
        let span_name = self.name.clone();
        info!(scenario = %span_name, %id, phase = %TestPhase::Setup, "setting up scenario");

        let store = self.store.unwrap_or_else(|| Arc::new(StateStore::new()));
        if !store.is_empty() {
            return Err(HarnessError::Setup(format!(
                "state store holds {} download(s) before the scenario started",
                store.count(&Filter::All)
            )));
        }

        let data_dir = tempfile::Builder::new()
            .prefix(&format!("dls-scenario-{}-", id.simple()))
            .tempdir()?;
        let data_path = data_dir.path().to_path_buf();

        let notifier = Arc::new(ChangeNotifier::new());
        store.watch(
            DOWNLOADS_RESOURCE,
            Arc::new(NotifierObserver::new(Arc::clone(&notifier))),
        );

        let mut env_config = EnvironmentConfig::new(&data_path, self.expected_worker.clone())
            .with_filename_prefix(self.config.filename_prefix.clone());
        for (name, policy) in self.policies {
            env_config = env_config.with_service_policy(name, policy);
        }
        let mut environment = ScenarioEnvironment::new(env_config, Arc::clone(&store), self.ambient);
        if let Some(hook) = self.launch_hook {
            environment = environment.with_launch_hook(hook);
        }
        let environment = Arc::new(environment);

        let peer = Arc::new(MockNetworkPeer::start()?);
        let clock = Arc::new(FakeClock::starting_at(SystemClock.now_millis()));

        let peer_faults: Arc<dyn FaultCheck> = peer.clone();
        let environment_faults: Arc<dyn FaultCheck> = environment.clone();
        let waiter = StatusWaiter::new(Arc::clone(&notifier), self.config.status_poll_interval)
            .with_fault_check(peer_faults)
            .with_fault_check(environment_faults);
        let correlator = RequestCorrelator::new(Arc::clone(&peer));

        let worker_clock: Arc<dyn Clock> = clock.clone();
        let worker = make_worker(WorkerContext::new(Arc::clone(&environment), worker_clock));

        debug!(
            scenario = %span_name,
            data_dir = %data_path.display(),
            peer = %peer.addr(),
            "scenario ready"
        );
        Ok(Scenario {
            name: self.name,
            id,
            expected_worker: self.expected_worker,
            config: self.config,
            data_dir: Some(data_dir),
            data_path,
            clock,
            store,
            environment,
            notifier,
            peer,
            correlator,
            waiter,
            worker,
            torn_down: false,
        })
    }
}

pub struct Scenario<W: Worker> {
    name: String,
    id: Uuid,
    expected_worker: ComponentName,
    config: HarnessConfig,
    data_dir: Option<TempDir>,
    data_path: PathBuf,
    clock: Arc<FakeClock>,
    store: Arc<StateStore>,
    environment: Arc<ScenarioEnvironment>,
    notifier: Arc<ChangeNotifier>,
    peer: Arc<MockNetworkPeer>,
    correlator: RequestCorrelator,
    waiter: StatusWaiter,
    worker: W,
    torn_down: bool,
}

impl Scenario<NoWorker> {
    /// Start describing a scenario whose only launchable component is
    /// `expected_worker`.
    pub fn builder(name: impl Into<String>, expected_worker: ComponentName) -> ScenarioBuilder {
        ScenarioBuilder {
            name: name.into(),
            expected_worker,
            config: HarnessConfig::default(),
            store: None,
            ambient: Arc::new(SystemServices),
            policies: Vec::new(),
            launch_hook: None,
        }
    }
}

impl<W: Worker> Scenario<W> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn environment(&self) -> &Arc<ScenarioEnvironment> {
        &self.environment
    }

    pub fn clock(&self) -> &Arc<FakeClock> {
        &self.clock
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn peer(&self) -> &Arc<MockNetworkPeer> {
        &self.peer
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_path
    }

    /// The context the worker was built with, for constructing collaborators
    /// such as a download provider.
    pub fn worker_context(&self) -> WorkerContext {
        let clock: Arc<dyn Clock> = self.clock.clone();
        WorkerContext::new(Arc::clone(&self.environment), clock)
    }

    // ── Peer scripting ──

    /// Enqueue a `text/plain` response.
    pub fn enqueue_response(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.enqueue_response_with(status, body, true);
    }

    pub fn enqueue_response_with(
        &self,
        status: u16,
        body: impl Into<Vec<u8>>,
        include_content_type: bool,
    ) {
        let response = if include_content_type {
            MockResponse::text(status, body)
        } else {
            MockResponse::new(status).with_body(body)
        };
        self.peer.enqueue(response);
    }

    pub fn enqueue_empty_response(&self, status: u16) {
        self.enqueue_response_with(status, Vec::new(), false);
    }

    pub fn enqueue(&self, response: MockResponse) {
        self.peer.enqueue(response);
    }

    /// Absolute URL of `path` on the mock peer.
    pub fn server_uri(&self, path: &str) -> String {
        self.peer.url(path)
    }

    // ── Driving the worker ──

    /// Insert a pending download row directly.
    pub fn insert_download(&self, uri: impl Into<String>) -> DownloadId {
        let id = self
            .store
            .insert(NewDownload::new(uri), self.clock.now_millis());
        debug!(scenario = %self.name, %id, "download inserted");
        id
    }

    pub fn status_reader(&self, id: DownloadId) -> StoreStatusReader {
        StoreStatusReader::new(Arc::clone(&self.store), id)
    }

    /// Start, or nudge, the worker under test.
    pub fn start_worker(&self) -> HarnessResult<()> {
        info!(scenario = %self.name, phase = %TestPhase::Execute, "starting worker");
        self.worker
            .start(&WorkRequest::update(self.expected_worker.clone()))?;
        Ok(())
    }

    /// Advance the fake clock past the configured retry delay.
    pub fn skip_retry_delay(&self) {
        self.advance_clock(self.config.retry_delay);
    }

    pub fn advance_clock(&self, by: Duration) {
        self.clock.advance(by);
        debug!(scenario = %self.name, ?by, now_ms = self.clock.now_millis(), "clock advanced");
    }

    // ── Waiting ──

    /// Next unread request at the peer, within `request_timeout`.
    pub fn take_request(&self) -> HarnessResult<RecordedRequest> {
        self.correlator.take_request(self.config.request_timeout)
    }

    pub fn take_request_for(&self, path_prefix: &str) -> HarnessResult<RecordedRequest> {
        self.correlator
            .take_request_for(path_prefix, self.config.request_timeout)
    }

    pub fn wait_for_state(
        &self,
        reader: &dyn StatusReader,
        expected: DownloadStatus,
        timeout: Duration,
    ) -> HarnessResult<WaitOutcome> {
        self.waiter.wait_for_state(reader, expected, timeout)
    }

    /// Wait up to `request_timeout` for `status`.
    pub fn wait_for_download_to_stop(
        &self,
        reader: &dyn StatusReader,
        status: DownloadStatus,
    ) -> HarnessResult<WaitOutcome> {
        self.wait_for_state(reader, status, self.config.request_timeout)
    }

    /// Start the worker, take the request it sends to the peer, then wait
    /// for `status`.
    ///
    /// Fails with `RequestTimeout` if the worker never contacts the peer,
    /// even when the download already shows `status`.
    pub fn run_until_status(
        &self,
        reader: &dyn StatusReader,
        status: DownloadStatus,
    ) -> HarnessResult<(RecordedRequest, WaitOutcome)> {
        self.start_worker()?;
        let request = self.take_request()?;
        let outcome = self.wait_for_download_to_stop(reader, status)?;
        Ok((request, outcome))
    }

    /// Drain the worker without tearing anything down.
    ///
    /// Use between phases, e.g. after a download parks for retry and before
    /// nudging the worker again, so the finished task has released the row.
    pub fn wait_for_worker_idle(&self) -> DrainReport {
        ThreadDrain::from_config(&self.config).drain(&self.worker)
    }

    /// Surface faults recorded by the peer or the environment.
    pub fn check_faults(&self) -> HarnessResult<()> {
        self.peer.check_for_exceptions()?;
        self.environment.check_configuration()?;
        Ok(())
    }

    /// State of the scenario as JSON, for test logs.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "scenario": self.name,
            "id": self.id.to_string(),
            "now_ms": self.clock.now_millis(),
            "downloads": self.store.query(&Filter::All),
            "requests_seen": self.peer.request_count(),
            "pending_responses": self.peer.pending_responses(),
            "launches": self.environment.launch_requests().len(),
            "update_thread": self.worker.has_update_thread(),
            "quiescent": self.worker.is_quiescent(),
        })
    }

    // ── Teardown ──

    /// Delete every download's file, then every row. Returns rows removed.
    pub fn clean_up_downloads(&self) -> HarnessResult<usize> {
        for row in self.store.query(&Filter::All) {
            if let Some(path) = row.file_path {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "removed download file"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(self.store.delete(&Filter::All))
    }

    /// Drain, clean up and stop everything, then report recorded faults.
    pub fn teardown(mut self) -> HarnessResult<DrainReport> {
        self.teardown_in_place()
    }

    fn teardown_in_place(&mut self) -> HarnessResult<DrainReport> {
        self.torn_down = true;
        info!(scenario = %self.name, phase = %TestPhase::Teardown, "tearing down scenario");

        let report = ThreadDrain::from_config(&self.config).drain(&self.worker);
        let removed = self.clean_up_downloads();
        let stopped = self.worker.shutdown();
        let peer_stopped = self.peer.shutdown();
        self.release_data_dir();

        let removed = removed?;
        stopped?;
        peer_stopped?;
        self.check_faults()?;
        info!(
            scenario = %self.name,
            removed,
            quiesced = report.quiesced,
            "scenario torn down"
        );
        Ok(report)
    }

    fn release_data_dir(&mut self) {
        let Some(dir) = self.data_dir.take() else {
            return;
        };
        if self.config.keep_scenario_dirs {
            let kept = dir.keep();
            info!(scenario = %self.name, path = %kept.display(), "keeping scenario data directory");
        } else if let Err(err) = dir.close() {
            warn!(scenario = %self.name, error = %err, "failed to remove scenario data directory");
        }
    }
}

impl<W: Worker> Drop for Scenario<W> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(err) = self.teardown_in_place() {
            warn!(scenario = %self.name, error = %err, "teardown on drop failed");
        }
    }
}

impl<W: Worker> std::fmt::Debug for Scenario<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("data_dir", &self.data_path)
            .field("peer", &self.peer.addr())
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

/// Placeholder worker type that anchors [`Scenario::builder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorker;

impl Worker for NoWorker {
    fn start(&self, _request: &WorkRequest) -> Result<(), dls_common::WorkerError> {
        Ok(())
    }

    fn has_update_thread(&self) -> bool {
        false
    }

    fn is_quiescent(&self) -> bool {
        true
    }

    fn shutdown(&self) -> Result<(), dls_common::WorkerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use dls_common::EnvironmentError;

    fn idle_scenario(name: &str) -> Scenario<NoWorker> {
        Scenario::builder(name, ComponentName::new("idle"))
            .build(|_| NoWorker)
            .unwrap()
    }

    #[test]
    fn test_setup_rejects_non_empty_store() {
        let store = Arc::new(StateStore::new());
        store.insert(NewDownload::new("http://127.0.0.1/left-over"), 0);

        let err = Scenario::builder("dirty", ComponentName::new("idle"))
            .store(store)
            .build(|_| NoWorker)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("1 download"));
    }

    #[test]
    fn test_setup_rejects_invalid_config() {
        let config = HarnessConfig {
            request_timeout: Duration::ZERO,
            ..HarnessConfig::default()
        };
        let err = Scenario::builder("bad-config", ComponentName::new("idle"))
            .config(config)
            .build(|_| NoWorker)
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidConfig(_)));
    }

    #[test]
    fn test_store_mutation_signals_notifier() {
        let scenario = idle_scenario("signals");
        assert!(!scenario.notifier().is_pending());
        scenario.insert_download("http://127.0.0.1/x");
        assert!(scenario.notifier().is_pending());
    }

    #[test]
    fn test_worker_context_uses_scenario_environment() {
        let mut seen = None;
        let scenario = Scenario::builder("context", ComponentName::new("idle"))
            .build(|ctx| {
                seen = Some(ctx.environment.data_dir().to_path_buf());
                NoWorker
            })
            .unwrap();
        assert_eq!(seen.as_deref(), Some(scenario.data_dir()));
        assert_eq!(
            scenario.environment().file_path("x"),
            scenario.data_dir().join("test.x")
        );
    }

    #[test]
    fn test_skip_retry_delay_advances_fake_clock() {
        let scenario = idle_scenario("clock");
        let before = scenario.clock().now_millis();
        scenario.skip_retry_delay();
        assert_eq!(scenario.clock().now_millis() - before, 61_000);
    }

    #[test]
    fn test_cleanup_removes_files_then_rows() {
        let scenario = idle_scenario("cleanup");
        let id = scenario.insert_download("http://127.0.0.1/x");
        let path = scenario.environment().file_path("download-1");
        std::fs::write(&path, "body").unwrap();
        scenario
            .store()
            .update(id, |row| row.file_path = Some(path.clone()))
            .unwrap();

        assert_eq!(scenario.clean_up_downloads().unwrap(), 1);
        assert!(!path.exists());
        assert!(scenario.store().is_empty());
    }

    #[test]
    fn test_teardown_removes_data_dir() {
        let scenario = idle_scenario("teardown");
        let dir = scenario.data_dir().to_path_buf();
        assert!(dir.is_dir());

        let report = scenario.teardown().unwrap();
        assert!(report.quiesced);
        assert!(!dir.exists());
    }

    #[test]
    fn test_teardown_surfaces_environment_violation() {
        let scenario = idle_scenario("violation");
        let _ = scenario.environment().service("location");

        let err = scenario.teardown().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Configuration(EnvironmentError::BlockedService(_))
        ));
    }

    #[test]
    fn test_drop_without_teardown_cleans_up() {
        let dir = {
            let scenario = idle_scenario("dropped");
            scenario.data_dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_run_until_status_requires_peer_traffic() {
        let config = HarnessConfig {
            request_timeout: Duration::from_millis(200),
            status_poll_interval: Duration::from_millis(20),
            ..HarnessConfig::default()
        };
        let scenario = Scenario::builder("no-traffic", ComponentName::new("idle"))
            .config(config)
            .build(|_| NoWorker)
            .unwrap();
        let id = scenario.insert_download("http://127.0.0.1/done");
        scenario
            .store()
            .update(id, |row| row.status = DownloadStatus::SUCCESS)
            .unwrap();

        let err = scenario
            .run_until_status(&scenario.status_reader(id), DownloadStatus::SUCCESS)
            .unwrap_err();
        assert!(matches!(err, HarnessError::RequestTimeout { .. }));
        assert_eq!(scenario.peer().request_count(), 0);
    }

    #[test]
    fn test_snapshot_lists_downloads() {
        let scenario = idle_scenario("snapshot");
        scenario.insert_download("http://127.0.0.1/x");
        let snapshot = scenario.snapshot();
        assert_eq!(snapshot["scenario"], "snapshot");
        assert_eq!(snapshot["downloads"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["quiescent"], true);
    }
}
