//! Shared setup for dls-common integration tests.

use std::sync::{Arc, Mutex};

use dls_common::{ChangeObserver, StoreChange};

#[ctor::ctor]
fn setup() {
    dls_common::testing::init_global_test_logging();
}

/// Observer that keeps every change it hears about.
#[derive(Default)]
pub struct RecordingObserver {
    changes: Mutex<Vec<StoreChange>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<StoreChange> {
        self.changes.lock().unwrap().clone()
    }
}

impl ChangeObserver for RecordingObserver {
    fn on_change(&self, change: &StoreChange) {
        self.changes.lock().unwrap().push(change.clone());
    }
}
