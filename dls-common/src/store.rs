//! In-memory state store shared by the worker and the harness.
//!
//! The store is the only channel through which the harness observes the
//! worker. Every committed mutation is reported to the observers watching the
//! affected resource, after the table lock has been released so observers may
//! read the store from inside the callback.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::types::{DownloadId, DownloadStatus};

/// Resource name of the downloads table.
pub const DOWNLOADS_RESOURCE: &str = "downloads";

/// Errors raised by state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("download {0} not found")]
    NotFound(DownloadId),
}

/// One persisted download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRow {
    pub id: DownloadId,
    /// Source address the worker fetches.
    pub uri: String,
    pub status: DownloadStatus,
    /// Local file holding the downloaded body, once one exists.
    pub file_path: Option<PathBuf>,
    /// File name hint supplied by the requester.
    pub file_hint: Option<String>,
    pub mime_type: Option<String>,
    pub etag: Option<String>,
    pub total_bytes: Option<u64>,
    pub current_bytes: u64,
    /// Consecutive retryable failures.
    pub num_failed: u32,
    /// Delay requested by the server before the next attempt.
    pub retry_after_ms: Option<u64>,
    /// Earliest clock time (ms) at which the worker may act on this row.
    pub next_action_at_ms: i64,
    /// Clock time (ms) of the last status change.
    pub last_modified_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Values supplied when enqueueing a new download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDownload {
    pub uri: String,
    #[serde(default)]
    pub file_hint: Option<String>,
}

impl NewDownload {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            file_hint: None,
        }
    }

    #[must_use]
    pub fn with_file_hint(mut self, hint: impl Into<String>) -> Self {
        self.file_hint = Some(hint.into());
        self
    }
}

/// Row selection for queries and deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Id(DownloadId),
    Status(DownloadStatus),
    /// Rows in a terminal status.
    Completed,
    /// Rows the worker still owns.
    Active,
}

impl Filter {
    pub fn matches(&self, row: &DownloadRow) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => row.id == *id,
            Self::Status(status) => row.status == *status,
            Self::Completed => row.status.is_completed(),
            Self::Active => !row.status.is_completed(),
        }
    }
}

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// Description of one committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Resource path, e.g. `downloads/3` or `downloads` for bulk deletes.
    pub resource: String,
    pub kind: ChangeKind,
    pub ids: Vec<DownloadId>,
}

impl StoreChange {
    fn for_row(kind: ChangeKind, id: DownloadId) -> Self {
        Self {
            resource: format!("{DOWNLOADS_RESOURCE}/{id}"),
            kind,
            ids: vec![id],
        }
    }

    /// True if an observer watching `watched` should hear about this change.
    pub fn touches(&self, watched: &str) -> bool {
        self.resource == watched
            || self
                .resource
                .strip_prefix(watched)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Hook invoked on every committed mutation of a watched resource.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, change: &StoreChange);
}

struct Watch {
    resource: String,
    observer: Arc<dyn ChangeObserver>,
}

/// Thread-safe downloads table with change notification.
pub struct StateStore {
    rows: Mutex<BTreeMap<DownloadId, DownloadRow>>,
    next_id: AtomicU64,
    watches: Mutex<Vec<Watch>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Register `observer` for mutations under `resource`.
    pub fn watch(&self, resource: impl Into<String>, observer: Arc<dyn ChangeObserver>) {
        lock(&self.watches).push(Watch {
            resource: resource.into(),
            observer,
        });
    }

    /// Insert a pending download and return its id.
    pub fn insert(&self, new: NewDownload, now_ms: i64) -> DownloadId {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let row = DownloadRow {
            id,
            uri: new.uri,
            status: DownloadStatus::PENDING,
            file_path: None,
            file_hint: new.file_hint,
            mime_type: None,
            etag: None,
            total_bytes: None,
            current_bytes: 0,
            num_failed: 0,
            retry_after_ms: None,
            next_action_at_ms: now_ms,
            last_modified_ms: now_ms,
            error_message: None,
        };
        lock(&self.rows).insert(id, row);
        self.notify(&StoreChange::for_row(ChangeKind::Inserted, id));
        id
    }

    /// Apply `mutate` to a copy of one row and commit it.
    ///
    /// If `mutate` panics the stored row is left as it was.
    pub fn update(
        &self,
        id: DownloadId,
        mutate: impl FnOnce(&mut DownloadRow),
    ) -> Result<DownloadRow, StoreError> {
        let updated = {
            let mut rows = lock(&self.rows);
            let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let mut draft = row.clone();
            mutate(&mut draft);
            *row = draft.clone();
            draft
        };
        self.notify(&StoreChange::for_row(ChangeKind::Updated, id));
        Ok(updated)
    }

    pub fn get(&self, id: DownloadId) -> Option<DownloadRow> {
        lock(&self.rows).get(&id).cloned()
    }

    /// Snapshot of all rows matching `filter`, in id order.
    pub fn query(&self, filter: &Filter) -> Vec<DownloadRow> {
        lock(&self.rows)
            .values()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect()
    }

    pub fn count(&self, filter: &Filter) -> usize {
        lock(&self.rows)
            .values()
            .filter(|row| filter.matches(row))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }

    /// Delete all rows matching `filter`; returns the number removed.
    pub fn delete(&self, filter: &Filter) -> usize {
        let removed: Vec<DownloadId> = {
            let mut rows = lock(&self.rows);
            let ids: Vec<DownloadId> = rows
                .values()
                .filter(|row| filter.matches(row))
                .map(|row| row.id)
                .collect();
            for id in &ids {
                rows.remove(id);
            }
            ids
        };

        match removed.as_slice() {
            [] => {}
            [id] => self.notify(&StoreChange::for_row(ChangeKind::Deleted, *id)),
            _ => self.notify(&StoreChange {
                resource: DOWNLOADS_RESOURCE.to_string(),
                kind: ChangeKind::Deleted,
                ids: removed.clone(),
            }),
        }
        removed.len()
    }

    fn notify(&self, change: &StoreChange) {
        let observers: Vec<Arc<dyn ChangeObserver>> = lock(&self.watches)
            .iter()
            .filter(|watch| change.touches(&watch.resource))
            .map(|watch| Arc::clone(&watch.observer))
            .collect();
        trace!(
            resource = %change.resource,
            kind = %change.kind,
            observers = observers.len(),
            "store change committed"
        );
        for observer in observers {
            observer.on_change(change);
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("rows", &lock(&self.rows).len())
            .field("watches", &lock(&self.watches).len())
            .finish()
    }
}

// Mutators run on a copy that is written back only once they return, so a
// lock poisoned by a panicking mutator still guards whole rows.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
