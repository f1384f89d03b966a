//! Store and environment behavior as seen from another thread.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::RecordingObserver;
use dls_common::testing::TestPhase;
use dls_common::{
    ChangeKind, ComponentName, DOWNLOADS_RESOURCE, DownloadStatus, EnvironmentConfig,
    EnvironmentError, Filter, NewDownload, ScenarioEnvironment, StateStore, SystemServices,
    WorkRequest, test_guard,
};
use serial_test::serial;

const WRITERS: usize = 4;
const ROWS_PER_WRITER: usize = 25;

#[test]
fn test_concurrent_writers_are_all_observed() {
    let guard = test_guard!();
    let store = Arc::new(StateStore::new());
    let observer = RecordingObserver::new();
    store.watch(DOWNLOADS_RESOURCE, observer.clone());

    guard.log(TestPhase::Execute, "spawning writers");
    let handles: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for n in 0..ROWS_PER_WRITER {
                    let id = store.insert(
                        NewDownload::new(format!("http://127.0.0.1/{writer}/{n}")),
                        0,
                    );
                    store
                        .update(id, |row| row.status = DownloadStatus::SUCCESS)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    guard.log(TestPhase::Verify, "checking ids and changes");
    let total = WRITERS * ROWS_PER_WRITER;
    let ids: HashSet<_> = store.query(&Filter::All).iter().map(|row| row.id).collect();
    assert_eq!(ids.len(), total);
    assert_eq!(store.count(&Filter::Completed), total);

    let changes = observer.changes();
    assert_eq!(changes.len(), total * 2);
    let inserted = changes
        .iter()
        .filter(|change| change.kind == ChangeKind::Inserted)
        .count();
    assert_eq!(inserted, total);
}

#[test]
fn test_observer_scoped_to_one_row() {
    let store = StateStore::new();
    let first = store.insert(NewDownload::new("http://127.0.0.1/a"), 0);
    let second = store.insert(NewDownload::new("http://127.0.0.1/b"), 0);

    let observer = RecordingObserver::new();
    store.watch(format!("{DOWNLOADS_RESOURCE}/{first}"), observer.clone());

    store.update(second, |row| row.num_failed = 1).unwrap();
    assert!(observer.changes().is_empty());

    store.update(first, |row| row.num_failed = 1).unwrap();
    let changes = observer.changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].ids, vec![first]);
}

#[test]
fn test_environment_shares_store_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let worker = ComponentName::new("tests::Worker");
    let environment = Arc::new(ScenarioEnvironment::new(
        EnvironmentConfig::new(dir.path(), worker.clone()),
        Arc::new(StateStore::new()),
        Arc::new(SystemServices),
    ));

    let remote = Arc::clone(&environment);
    let id = thread::spawn(move || {
        let id = remote
            .state_store()
            .insert(NewDownload::new("http://127.0.0.1/x"), 0);
        remote
            .start_service(&WorkRequest::for_download(worker, id))
            .unwrap();
        remote.service("location").unwrap_err();
        id
    })
    .join()
    .unwrap();

    assert!(environment.state_store().get(id).is_some());
    assert!(environment.has_service_been_started());
    assert_eq!(
        environment.check_configuration(),
        Err(EnvironmentError::BlockedService("location".to_string()))
    );
}

#[test]
#[serial]
#[allow(unsafe_code)]
fn test_guard_enabled_by_env_writes_log() {
    // SAFETY: env tests are #[serial]
    unsafe { std::env::set_var("DLS_TEST_LOGGING", "1") };
    {
        let guard = test_guard!();
        guard.log_with_data(
            TestPhase::Verify,
            "logging enabled",
            serde_json::json!({ "rows": 0 }),
        );
    }
    // SAFETY: env tests are #[serial]
    unsafe { std::env::remove_var("DLS_TEST_LOGGING") };
}
