//! Failure-injecting provider used by unit tests.

use crate::context::ExecutionContext;
use crate::criteria::{QueryCriteria, QuerySpec};
use crate::error::StorageError;
use crate::provider::{MemoryProvider, Record, RecordStream, StorageProvider};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type WriteHook = Box<dyn FnOnce() + Send>;

/// Wraps a [`MemoryProvider`] and fails selected calls
pub struct FaultyProvider {
    inner: MemoryProvider,
    /// Writes fail once this many records have been written
    fail_writes_after: Option<usize>,
    fail_deletes: bool,
    delete_delay: Option<Duration>,
    /// Runs once, after the first successful write
    after_first_write: Mutex<Option<WriteHook>>,
    written: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl FaultyProvider {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryProvider::new(name),
            fail_writes_after: None,
            fail_deletes: false,
            delete_delay: None,
            after_first_write: Mutex::new(None),
            written: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_writes_after(mut self, records: usize) -> Self {
        self.fail_writes_after = Some(records);
        self
    }

    pub fn failing_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    pub fn delaying_deletes(mut self, delay: Duration) -> Self {
        self.delete_delay = Some(delay);
        self
    }

    pub fn after_first_write(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.after_first_write.lock() = Some(Box::new(hook));
        self
    }

    pub fn inner(&self) -> &MemoryProvider {
        &self.inner
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Seed records without going through fault injection
    pub fn seed(&self, table: &str, records: &[Record]) {
        let ctx = ExecutionContext::new("seed");
        futures::executor::block_on(self.inner.insert_batch(table, records, &ctx))
            .expect("memory insert cannot fail");
    }

    fn admit(&self, count: usize) -> Result<(), StorageError> {
        if let Some(limit) = self.fail_writes_after {
            if self.written.load(Ordering::SeqCst) + count > limit {
                return Err(StorageError::backend(self.inner.name(), "injected write failure"));
            }
        }
        self.written.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }

    fn written_hook(&self) {
        let hook = self.after_first_write.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[async_trait]
impl StorageProvider for FaultyProvider {
    async fn insert(
        &self,
        table: &str,
        record: &Record,
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError> {
        self.admit(1)?;
        self.inner.insert(table, record, ctx).await?;
        self.written_hook();
        Ok(())
    }

    async fn insert_batch(
        &self,
        table: &str,
        records: &[Record],
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError> {
        self.admit(records.len())?;
        self.inner.insert_batch(table, records, ctx).await?;
        self.written_hook();
        Ok(())
    }

    fn execute_query(&self, spec: &QuerySpec, ctx: &ExecutionContext) -> RecordStream {
        self.inner.execute_query(spec, ctx)
    }

    async fn delete(
        &self,
        table: &str,
        criteria: &QueryCriteria,
        ctx: &ExecutionContext,
    ) -> Result<u64, StorageError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_deletes {
            return Err(StorageError::backend(self.inner.name(), "injected delete failure"));
        }
        self.inner.delete(table, criteria, ctx).await
    }
}
