//! Shared setup for scenario integration tests.

use std::time::Duration;

use dls_common::ComponentName;
use dls_common::testing::init_global_test_logging;
use dls_harness::{HarnessConfig, Scenario, ScenarioBuilder};
use dls_worker::{DownloadService, download_service_component};

#[ctor::ctor]
fn setup() {
    init_global_test_logging();
}

/// Defaults with a tighter poll loop so scenarios finish quickly.
pub fn fast_config() -> HarnessConfig {
    HarnessConfig {
        status_poll_interval: Duration::from_millis(20),
        drain_poll_interval: Duration::from_millis(10),
        grace_period: Duration::from_millis(10),
        ..HarnessConfig::default()
    }
}

pub fn builder(name: &str) -> ScenarioBuilder {
    builder_expecting(name, download_service_component())
}

pub fn builder_expecting(name: &str, expected: ComponentName) -> ScenarioBuilder {
    Scenario::builder(name, expected).config(fast_config())
}

pub fn download_scenario(name: &str) -> Scenario<DownloadService> {
    builder(name)
        .build(DownloadService::new)
        .unwrap_or_else(|err| panic!("scenario {name} failed to set up: {err}"))
}
