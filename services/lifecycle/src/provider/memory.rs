use super::{Record, RecordStream, StorageProvider};
use crate::context::ExecutionContext;
use crate::criteria::{QueryCriteria, QuerySpec};
use crate::error::StorageError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

/// In-process key/value provider.
///
/// Serves as the hot-tier cache in single-node deployments and as the
/// default backend for local development and tests. Records are kept per
/// table, keyed by ID.
pub struct MemoryProvider {
    name: String,
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records currently held for a table
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// All records of a table, ordered by creation time then ID
    pub fn records(&self, table: &str) -> Vec<Record> {
        let tables = self.tables.read();
        let mut records: Vec<Record> = tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn insert(
        &self,
        table: &str,
        record: &Record,
        _ctx: &ExecutionContext,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    #[instrument(
        skip(self, records, ctx),
        fields(provider = %self.name, count = records.len(), correlation_id = %ctx.correlation_id)
    )]
    async fn insert_batch(
        &self,
        table: &str,
        records: &[Record],
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError> {
        // Single write lock, so the batch lands atomically
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        for record in records {
            rows.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn execute_query(&self, spec: &QuerySpec, _ctx: &ExecutionContext) -> RecordStream {
        let mut matching: Vec<Record> = self
            .records(&spec.table)
            .into_iter()
            .filter(|record| record.matches(&spec.criteria))
            .collect();

        if let Some(limit) = spec.limit {
            matching.truncate(limit);
        }

        debug!(
            provider = %self.name,
            table = %spec.table,
            count = matching.len(),
            "Memory query resolved"
        );

        stream::iter(matching.into_iter().map(Ok)).boxed()
    }

    #[instrument(
        skip(self, criteria, ctx),
        fields(provider = %self.name, correlation_id = %ctx.correlation_id)
    )]
    async fn delete(
        &self,
        table: &str,
        criteria: &QueryCriteria,
        ctx: &ExecutionContext,
    ) -> Result<u64, StorageError> {
        let mut tables = self.tables.write();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };

        let before = rows.len();
        rows.retain(|_, record| !record.matches(criteria));
        let deleted = (before - rows.len()) as u64;

        debug!(table = %table, deleted = deleted, "Deleted records from memory");
        Ok(deleted)
    }
}
