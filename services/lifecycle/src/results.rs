//! Outcomes of lifecycle operations.
//!
//! Operation methods never return errors; they return one of these with a
//! `success` flag and whatever partial counts were reached.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::time::Duration;

fn serialize_millis<S>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

/// Outcome of moving a table's records between tiers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TieringResult {
    pub operation_id: String,
    pub success: bool,
    pub message: String,
    pub records_processed: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl TieringResult {
    pub fn success(
        operation_id: impl Into<String>,
        message: impl Into<String>,
        records_processed: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            success: true,
            message: message.into(),
            records_processed,
            elapsed,
        }
    }

    pub fn failure(
        operation_id: impl Into<String>,
        message: impl Into<String>,
        records_processed: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            success: false,
            message: message.into(),
            records_processed,
            elapsed,
        }
    }
}

/// Outcome of archiving a table's records
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivalResult {
    pub operation_id: String,
    pub success: bool,
    pub message: String,
    pub records_archived: u64,
    /// Records deleted from the source after archiving
    pub records_removed: u64,
    pub archive_location: Option<String>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl ArchivalResult {
    pub fn success(
        operation_id: impl Into<String>,
        records_archived: u64,
        records_removed: u64,
        archive_location: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            success: true,
            message: format!("Archived {} records", records_archived),
            records_archived,
            records_removed,
            archive_location: Some(archive_location.into()),
            elapsed,
            error: None,
        }
    }

    pub fn failure(
        operation_id: impl Into<String>,
        error: impl ToString,
        records_archived: u64,
        archive_location: Option<String>,
        elapsed: Duration,
    ) -> Self {
        let error = error.to_string();
        Self {
            operation_id: operation_id.into(),
            success: false,
            message: format!("Archival failed after {} records", records_archived),
            records_archived,
            records_removed: 0,
            archive_location,
            elapsed,
            error: Some(error),
        }
    }
}

/// Outcome of one (policy, table) retention unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRetentionResult {
    pub table: String,
    pub policy: String,
    pub success: bool,
    pub records_deleted: u64,
    pub records_archived: u64,
    pub error: Option<String>,
}

/// Aggregate outcome of a retention sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionResult {
    pub tables_processed: usize,
    pub successful_tables: usize,
    /// Direct deletes plus deletes that followed an archive
    pub total_records_deleted: u64,
    pub table_results: Vec<TableRetentionResult>,
}

impl RetentionResult {
    pub fn from_tables(table_results: Vec<TableRetentionResult>) -> Self {
        Self {
            tables_processed: table_results.len(),
            successful_tables: table_results.iter().filter(|r| r.success).count(),
            total_records_deleted: table_results.iter().map(|r| r.records_deleted).sum(),
            table_results,
        }
    }

    pub fn failed_tables(&self) -> impl Iterator<Item = &TableRetentionResult> {
        self.table_results.iter().filter(|r| !r.success)
    }
}

/// Report of one scheduler cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub retention: RetentionResult,
    pub tiering: Vec<TieringResult>,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn records_moved(&self) -> u64 {
        self.tiering
            .iter()
            .filter(|r| r.success)
            .map(|r| r.records_processed)
            .sum()
    }

    pub fn failed_tiering(&self) -> usize {
        self.tiering.iter().filter(|r| !r.success).count()
    }
}
