//! Shared vocabulary for the download sync harness.
//!
//! The worker and the harness only meet through the types in this crate: the
//! [`StateStore`] the worker writes and the harness observes, the
//! [`ScenarioEnvironment`] the worker is constructed with, and the [`Worker`]
//! capability the harness drives.

pub mod clock;
pub mod config;
pub mod environment;
pub mod store;
pub mod testing;
pub mod types;
pub mod worker;

pub use clock::{Clock, FakeClock, SystemClock};
pub use environment::{
    AmbientServices, CONNECTIVITY_SERVICE, DEFAULT_FILENAME_PREFIX, EnvironmentConfig,
    EnvironmentError, LaunchHook, NOTIFICATION_SERVICE, POWER_SERVICE, ScenarioEnvironment,
    ServiceHandle, ServiceOrigin, ServicePolicy, SystemServices,
};
pub use store::{
    ChangeKind, ChangeObserver, DOWNLOADS_RESOURCE, DownloadRow, Filter, NewDownload, StateStore,
    StoreChange, StoreError,
};
pub use types::{ComponentName, DownloadId, DownloadStatus, WorkRequest};
pub use worker::{ActivityGuard, ActivityTracker, Worker, WorkerContext, WorkerError};
