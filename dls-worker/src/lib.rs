//! Reference background download engine.
//!
//! [`DownloadService`] implements the [`dls_common::Worker`] capability: a
//! single update thread that dispatches ready rows to per-download task
//! threads, fetching over HTTP with `ureq` and committing every status change
//! to the scenario's state store. [`DownloadProvider`] is the client-facing
//! insert path that triggers the service's self-relaunch.

pub mod error;
pub mod policy;
pub mod provider;
pub mod service;
mod task;

pub use error::DownloadError;
pub use policy::{Decision, RetryPolicy};
pub use provider::DownloadProvider;
pub use service::{DOWNLOAD_SERVICE, DownloadService, ServiceConfig, download_service_component};
