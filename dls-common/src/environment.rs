//! Substitute execution context handed to the worker under test.
//!
//! Rather than overriding methods of a base environment, the scenario builds
//! an [`EnvironmentConfig`] (service policy table, file-name namespace,
//! expected worker component) and combines it with an injected
//! [`StateStore`], the real [`AmbientServices`] and an optional launch hook.
//! The worker receives the resulting [`ScenarioEnvironment`] in its
//! constructor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::store::StateStore;
use crate::types::{ComponentName, WorkRequest};

pub const NOTIFICATION_SERVICE: &str = "notification";
pub const POWER_SERVICE: &str = "power";
pub const CONNECTIVITY_SERVICE: &str = "connectivity";

/// Default prefix applied to every file name the worker creates.
pub const DEFAULT_FILENAME_PREFIX: &str = "test.";

/// Operations the environment refuses because the scenario did not model them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("service '{0}' is blocked in this scenario")]
    BlockedService(String),

    #[error("service '{0}' is passed through but the real environment does not provide it")]
    UnavailableService(String),

    #[error("unexpected launch request for component '{requested}' (expected '{expected}')")]
    UnexpectedLaunch {
        requested: ComponentName,
        expected: ComponentName,
    },

    #[error("launch hook rejected request for '{component}': {reason}")]
    LaunchRejected {
        component: ComponentName,
        reason: String,
    },
}

/// How the environment answers a request for one ambient service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePolicy {
    /// Delegate to the real environment.
    Passthrough,
    /// Hand out an inert stub.
    Stubbed,
    /// Refuse; reaching for it is a configuration error.
    Blocked,
}

/// Where a service handle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrigin {
    Real,
    Stub,
}

/// Handle to an ambient service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    name: String,
    origin: ServiceOrigin,
}

impl ServiceHandle {
    pub fn real(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: ServiceOrigin::Real,
        }
    }

    pub fn stub(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: ServiceOrigin::Stub,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> ServiceOrigin {
        self.origin
    }

    pub fn is_stub(&self) -> bool {
        self.origin == ServiceOrigin::Stub
    }

    /// Deliver a user-visible message (notifications) through this service.
    pub fn post(&self, message: &str) {
        info!(service = %self.name, origin = ?self.origin, "{message}");
    }
}

/// The real environment's service lookup.
pub trait AmbientServices: Send + Sync {
    fn lookup(&self, name: &str) -> Option<ServiceHandle>;
}

/// Services available from the host process.
#[derive(Debug, Clone, Default)]
pub struct SystemServices;

impl AmbientServices for SystemServices {
    fn lookup(&self, name: &str) -> Option<ServiceHandle> {
        match name {
            NOTIFICATION_SERVICE | POWER_SERVICE | CONNECTIVITY_SERVICE => {
                Some(ServiceHandle::real(name))
            }
            _ => None,
        }
    }
}

/// Callback invoked for every accepted launch of the expected worker.
pub type LaunchHook = Arc<dyn Fn(&WorkRequest) -> Result<(), String> + Send + Sync>;

/// Explicit configuration for a scenario environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Prefix applied to every file name, keeping test files apart from real data.
    pub filename_prefix: String,
    /// Directory holding the scenario's files.
    pub data_dir: PathBuf,
    /// The only component the system under test may launch.
    pub expected_worker: ComponentName,
    /// Service name → policy. Unlisted services are blocked.
    pub service_policies: BTreeMap<String, ServicePolicy>,
}

impl EnvironmentConfig {
    /// Default table: notification and power pass through, connectivity is stubbed.
    pub fn new(data_dir: impl Into<PathBuf>, expected_worker: ComponentName) -> Self {
        let mut service_policies = BTreeMap::new();
        service_policies.insert(NOTIFICATION_SERVICE.to_string(), ServicePolicy::Passthrough);
        service_policies.insert(POWER_SERVICE.to_string(), ServicePolicy::Passthrough);
        service_policies.insert(CONNECTIVITY_SERVICE.to_string(), ServicePolicy::Stubbed);
        Self {
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            data_dir: data_dir.into(),
            expected_worker,
            service_policies,
        }
    }

    #[must_use]
    pub fn with_filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_service_policy(mut self, name: impl Into<String>, policy: ServicePolicy) -> Self {
        self.service_policies.insert(name.into(), policy);
        self
    }

    pub fn policy_for(&self, name: &str) -> ServicePolicy {
        self.service_policies
            .get(name)
            .copied()
            .unwrap_or(ServicePolicy::Blocked)
    }
}

/// The execution context shared by the worker and the harness for one scenario.
pub struct ScenarioEnvironment {
    config: EnvironmentConfig,
    store: Arc<StateStore>,
    ambient: Arc<dyn AmbientServices>,
    launch_hook: Option<LaunchHook>,
    launches: Mutex<Vec<WorkRequest>>,
    violations: Mutex<Vec<EnvironmentError>>,
}

impl ScenarioEnvironment {
    pub fn new(
        config: EnvironmentConfig,
        store: Arc<StateStore>,
        ambient: Arc<dyn AmbientServices>,
    ) -> Self {
        Self {
            config,
            store,
            ambient,
            launch_hook: None,
            launches: Mutex::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_launch_hook(mut self, hook: LaunchHook) -> Self {
        self.launch_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// The test-scoped state store.
    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Namespaced location for a file the worker wants to create.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{}", self.config.filename_prefix, name))
    }

    /// Resolve an ambient service according to the policy table.
    pub fn service(&self, name: &str) -> Result<ServiceHandle, EnvironmentError> {
        match self.config.policy_for(name) {
            ServicePolicy::Passthrough => self.ambient.lookup(name).ok_or_else(|| {
                self.record_violation(EnvironmentError::UnavailableService(name.to_string()))
            }),
            ServicePolicy::Stubbed => {
                debug!(service = name, "handing out stub service");
                Ok(ServiceHandle::stub(name))
            }
            ServicePolicy::Blocked => {
                Err(self.record_violation(EnvironmentError::BlockedService(name.to_string())))
            }
        }
    }

    /// Intercept a launch request from the system under test.
    ///
    /// Launches of the expected worker are recorded, never performed. Any
    /// other component is an unmodeled dependency and fails loudly.
    pub fn start_service(&self, request: &WorkRequest) -> Result<ComponentName, EnvironmentError> {
        if request.component != self.config.expected_worker {
            return Err(self.record_violation(EnvironmentError::UnexpectedLaunch {
                requested: request.component.clone(),
                expected: self.config.expected_worker.clone(),
            }));
        }

        lock(&self.launches).push(request.clone());
        info!(
            component = %request.component,
            download = ?request.download,
            "intercepted worker launch"
        );

        if let Some(hook) = &self.launch_hook {
            hook(request).map_err(|reason| {
                self.record_violation(EnvironmentError::LaunchRejected {
                    component: request.component.clone(),
                    reason,
                })
            })?;
        }
        Ok(request.component.clone())
    }

    /// Whether the system under test tried to launch the worker.
    pub fn has_service_been_started(&self) -> bool {
        !lock(&self.launches).is_empty()
    }

    pub fn launch_requests(&self) -> Vec<WorkRequest> {
        lock(&self.launches).clone()
    }

    /// Violations recorded so far, without clearing them.
    pub fn violations(&self) -> Vec<EnvironmentError> {
        lock(&self.violations).clone()
    }

    /// Surface the first recorded violation, if any.
    pub fn check_configuration(&self) -> Result<(), EnvironmentError> {
        match lock(&self.violations).first() {
            Some(violation) => Err(violation.clone()),
            None => Ok(()),
        }
    }

    fn record_violation(&self, violation: EnvironmentError) -> EnvironmentError {
        error!(%violation, "scenario environment configuration error");
        lock(&self.violations).push(violation.clone());
        violation
    }
}

impl std::fmt::Debug for ScenarioEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioEnvironment")
            .field("config", &self.config)
            .field("launches", &lock(&self.launches).len())
            .field("violations", &lock(&self.violations).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> ComponentName {
        ComponentName::new("dls_worker::DownloadService")
    }

    fn environment(config: EnvironmentConfig) -> ScenarioEnvironment {
        ScenarioEnvironment::new(
            config,
            Arc::new(StateStore::new()),
            Arc::new(SystemServices),
        )
    }

    #[test]
    fn test_file_path_is_namespaced() {
        let env = environment(EnvironmentConfig::new("/tmp/scenario", worker()));
        assert_eq!(
            env.file_path("download-1"),
            PathBuf::from("/tmp/scenario/test.download-1")
        );
    }

    #[test]
    fn test_default_policy_table() {
        let env = environment(EnvironmentConfig::new("/tmp", worker()));

        let power = env.service(POWER_SERVICE).unwrap();
        assert_eq!(power.origin(), ServiceOrigin::Real);
        assert!(env.service(CONNECTIVITY_SERVICE).unwrap().is_stub());

        let err = env.service("location").unwrap_err();
        assert_eq!(err, EnvironmentError::BlockedService("location".to_string()));
        assert_eq!(env.check_configuration(), Err(err));
    }

    #[test]
    fn test_passthrough_of_missing_real_service_is_violation() {
        let config =
            EnvironmentConfig::new("/tmp", worker()).with_service_policy("vibrator", ServicePolicy::Passthrough);
        let env = environment(config);
        assert!(matches!(
            env.service("vibrator"),
            Err(EnvironmentError::UnavailableService(_))
        ));
        assert_eq!(env.violations().len(), 1);
    }

    #[test]
    fn test_expected_launch_is_recorded_not_performed() {
        let env = environment(EnvironmentConfig::new("/tmp", worker()));
        assert!(!env.has_service_been_started());

        let request = WorkRequest::for_download(worker(), DownloadId(1));
        assert_eq!(env.start_service(&request).unwrap(), worker());
        assert!(env.has_service_been_started());
        assert_eq!(env.launch_requests(), vec![request]);
        assert!(env.check_configuration().is_ok());
    }

    #[test]
    fn test_unexpected_launch_fails_loudly() {
        let env = environment(EnvironmentConfig::new("/tmp", worker()));
        let request = WorkRequest::update(ComponentName::new("media_scanner"));

        let err = env.start_service(&request).unwrap_err();
        assert!(matches!(err, EnvironmentError::UnexpectedLaunch { .. }));
        assert!(!env.has_service_been_started());
        assert!(env.check_configuration().is_err());
    }

    #[test]
    fn test_launch_hook_runs_and_may_reject() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let env = environment(EnvironmentConfig::new("/tmp", worker())).with_launch_hook(Arc::new(
            move |_request: &WorkRequest| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err("only one launch allowed".to_string())
                }
            },
        ));

        let request = WorkRequest::update(worker());
        assert!(env.start_service(&request).is_ok());
        assert!(matches!(
            env.start_service(&request),
            Err(EnvironmentError::LaunchRejected { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
