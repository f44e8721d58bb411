use crate::context::ExecutionContext;
use crate::criteria::{QuerySpec, TieringCriteria};
use crate::error::LifecycleError;
use crate::provider::{Record, StorageProvider};
use crate::tracker::LifecycleOperation;
use futures::StreamExt;
use std::mem;
use tracing::{debug, info, instrument};

/// Copies matching records from one provider to another in batches.
///
/// Every batch is written to the target before the source is touched; the
/// source delete runs once, after the last batch, and only when requested.
/// A failure at any point leaves the source intact.
pub struct DataMovement<'a> {
    pub source: &'a dyn StorageProvider,
    pub target: &'a dyn StorageProvider,
    pub table: &'a str,
    pub batch_size: usize,
}

impl DataMovement<'_> {
    /// Run the movement, returning the number of records read from the source.
    ///
    /// Errors are wrapped in [`LifecycleError::PartialProgress`] carrying the
    /// records read before the failure.
    #[instrument(skip_all, fields(table = %self.table, operation_id = %operation.id()))]
    pub async fn run(
        &self,
        criteria: &TieringCriteria,
        operation: &LifecycleOperation,
        ctx: &ExecutionContext,
    ) -> Result<u64, LifecycleError> {
        let mut read: u64 = 0;
        self.copy(criteria, operation, ctx, &mut read)
            .await
            .map_err(|source| LifecycleError::PartialProgress {
                processed: read,
                source: Box::new(source),
            })?;
        Ok(read)
    }

    async fn copy(
        &self,
        criteria: &TieringCriteria,
        operation: &LifecycleOperation,
        ctx: &ExecutionContext,
        read: &mut u64,
    ) -> Result<(), LifecycleError> {
        let batch_size = self.batch_size.max(1);
        let spec = QuerySpec::new(self.table, criteria.criteria.clone());
        let mut stream = self.source.execute_query(&spec, ctx);
        let mut batch: Vec<Record> = Vec::with_capacity(batch_size);
        let mut batches = 0usize;

        operation.check_cancelled()?;

        while let Some(record) = stream.next().await {
            batch.push(record?);
            *read += 1;

            if batch.len() >= batch_size {
                operation.check_cancelled()?;
                self.flush(&mut batch, ctx).await?;
                batches += 1;
            }
        }

        if !batch.is_empty() {
            operation.check_cancelled()?;
            self.flush(&mut batch, ctx).await?;
            batches += 1;
        }

        debug!(records = *read, batches, "All batches written to target");

        if criteria.remove_from_source && *read > 0 {
            operation.check_cancelled()?;
            let removed = self.source.delete(self.table, &criteria.criteria, ctx).await?;
            info!(records = *read, removed, "Moved records removed from source");
        }

        Ok(())
    }

    async fn flush(
        &self,
        batch: &mut Vec<Record>,
        ctx: &ExecutionContext,
    ) -> Result<(), LifecycleError> {
        let records = mem::take(batch);
        self.target.insert_batch(self.table, &records, ctx).await?;
        debug!(count = records.len(), "Batch written to target");
        Ok(())
    }
}
