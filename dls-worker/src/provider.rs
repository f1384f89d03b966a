//! Front door for clients enqueueing downloads.
//!
//! Inserting a row asks the environment to (re)launch the download service,
//! the same self-relaunch a real provider performs. Under a scenario
//! environment that launch is intercepted and recorded.

use std::sync::Arc;

use dls_common::{
    Clock, DownloadId, DownloadRow, DownloadStatus, EnvironmentError, Filter, NewDownload,
    ScenarioEnvironment, WorkRequest, WorkerContext,
};
use tracing::info;

use crate::service::download_service_component;

pub struct DownloadProvider {
    environment: Arc<ScenarioEnvironment>,
    clock: Arc<dyn Clock>,
}

impl DownloadProvider {
    pub fn new(context: &WorkerContext) -> Self {
        Self {
            environment: Arc::clone(&context.environment),
            clock: Arc::clone(&context.clock),
        }
    }

    /// Enqueue a download and request a service launch for it.
    ///
    /// The row is committed even when the launch is refused.
    pub fn insert(&self, download: NewDownload) -> Result<DownloadId, EnvironmentError> {
        let id = self
            .environment
            .state_store()
            .insert(download, self.clock.now_millis());
        info!(%id, "download enqueued");
        self.environment
            .start_service(&WorkRequest::for_download(download_service_component(), id))?;
        Ok(id)
    }

    pub fn status(&self, id: DownloadId) -> Option<DownloadStatus> {
        self.environment.state_store().get(id).map(|row| row.status)
    }

    pub fn query(&self, filter: &Filter) -> Vec<DownloadRow> {
        self.environment.state_store().query(filter)
    }

    /// Remove a download; an in-flight attempt notices on its next commit.
    pub fn remove(&self, id: DownloadId) -> bool {
        self.environment.state_store().delete(&Filter::Id(id)) > 0
    }
}
