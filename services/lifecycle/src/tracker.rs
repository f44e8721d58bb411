//! In-flight operation tracking.
//!
//! Every tiering, archival or retention operation registers itself here for
//! as long as it runs. Registration hands back an [`OperationGuard`]; the
//! guard removes the entry when dropped, so bookkeeping is cleared on every
//! exit path of the operation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::LifecycleError;

/// Kind of lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Tiering,
    Archival,
    Retention,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Tiering => "tiering",
            OperationKind::Archival => "archival",
            OperationKind::Retention => "retention",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Cancelled,
    Completed,
    Failed,
}

/// One in-flight unit of work
#[derive(Debug)]
pub struct LifecycleOperation {
    id: String,
    kind: OperationKind,
    table: String,
    started_at: DateTime<Utc>,
    status: Mutex<OperationStatus>,
    token: CancellationToken,
}

impl LifecycleOperation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> OperationStatus {
        *self.status.lock()
    }

    /// Mark the operation cancelled and trigger its token.
    ///
    /// In-progress provider calls are not interrupted; the operation body
    /// observes the token at its next batch boundary.
    pub fn cancel(&self) {
        let mut status = self.status.lock();
        if *status == OperationStatus::Running {
            *status = OperationStatus::Cancelled;
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`LifecycleError::Cancelled`] if cancellation was requested
    pub fn check_cancelled(&self) -> Result<(), LifecycleError> {
        if self.is_cancelled() {
            Err(LifecycleError::Cancelled(self.id.clone()))
        } else {
            Ok(())
        }
    }

    fn finish(&self, success: bool) {
        let mut status = self.status.lock();
        if *status == OperationStatus::Running {
            *status = if success {
                OperationStatus::Completed
            } else {
                OperationStatus::Failed
            };
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            table: self.table.clone(),
            started_at: self.started_at,
            status: self.status(),
        }
    }
}

/// Serializable view of an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub kind: OperationKind,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub status: OperationStatus,
}

/// Concurrent registry of in-flight operations
#[derive(Debug, Default)]
pub struct OperationTracker {
    operations: RwLock<HashMap<String, Arc<LifecycleOperation>>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new running operation.
    ///
    /// Its cancellation token is a child of `parent`, so cancelling the
    /// parent reaches every operation started under it.
    pub fn register(
        self: &Arc<Self>,
        id: impl Into<String>,
        kind: OperationKind,
        table: impl Into<String>,
        parent: &CancellationToken,
    ) -> Result<OperationGuard, LifecycleError> {
        let id = id.into();
        let mut operations = self.operations.write();
        if operations.contains_key(&id) {
            return Err(LifecycleError::DuplicateOperation(id));
        }

        let operation = Arc::new(LifecycleOperation {
            id: id.clone(),
            kind,
            table: table.into(),
            started_at: Utc::now(),
            status: Mutex::new(OperationStatus::Running),
            token: parent.child_token(),
        });
        operations.insert(id.clone(), operation.clone());

        debug!(operation_id = %id, kind = %kind, table = %operation.table, "Operation registered");

        Ok(OperationGuard {
            tracker: Arc::clone(self),
            operation,
            success: false,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<LifecycleOperation>> {
        self.operations.read().get(id).cloned()
    }

    /// Cancel one operation; returns false if it is not tracked
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(operation) => {
                operation.cancel();
                info!(operation_id = %id, "Operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked operation, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let operations: Vec<Arc<LifecycleOperation>> =
            self.operations.read().values().cloned().collect();
        for operation in &operations {
            operation.cancel();
        }
        operations.len()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.operations.write().clear();
    }

    pub fn snapshot(&self) -> Vec<OperationSnapshot> {
        let mut snapshots: Vec<OperationSnapshot> = self
            .operations
            .read()
            .values()
            .map(|op| op.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.operations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &str) {
        self.operations.write().remove(id);
    }
}

/// Keeps an operation registered until dropped
pub struct OperationGuard {
    tracker: Arc<OperationTracker>,
    operation: Arc<LifecycleOperation>,
    success: bool,
}

impl OperationGuard {
    pub fn operation(&self) -> &LifecycleOperation {
        &self.operation
    }

    /// Record the outcome reported when the guard is dropped
    pub fn set_success(&mut self, success: bool) {
        self.success = success;
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.operation.finish(self.success);
        self.tracker.remove(&self.operation.id);
        debug!(
            operation_id = %self.operation.id,
            status = ?self.operation.status(),
            "Operation finished"
        );
    }
}
