use super::{Record, RecordStream, StorageProvider};
use crate::config::S3Config;
use crate::context::ExecutionContext;
use crate::criteria::{QueryCriteria, QuerySpec};
use crate::error::StorageError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, instrument, warn};

/// Listing state for streaming queries
#[derive(Debug, Clone)]
struct ListCursor {
    continuation: Option<String>,
    remaining: Option<usize>,
    exhausted: bool,
}

/// Object-store provider backed by S3 (or any S3-compatible store).
///
/// Each record is one JSON object. Keys are partitioned by table and
/// creation date so bucket lifecycle rules and prefix listings line up with
/// age thresholds:
///
/// `{prefix}/{table}/{YYYY-MM-DD}/{id}.json`
///
/// Criteria are evaluated client-side after listing the table prefix.
pub struct S3Provider {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: String,
    list_page_size: i32,
}

impl S3Provider {
    /// Create a new S3 provider
    pub async fn new(name: impl Into<String>, config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 provider initialized"
        );

        Ok(Self {
            name: name.into(),
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            list_page_size: config.list_page_size,
        })
    }

    /// Prefix under which all objects of a table live
    pub fn table_prefix(&self, table: &str) -> String {
        table_prefix(&self.prefix, table)
    }

    /// Object key for a record
    pub fn object_key(&self, table: &str, record: &Record) -> String {
        object_key(&self.prefix, table, record)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn backend_error<E: std::error::Error>(&self, err: E) -> StorageError {
        StorageError::backend(&self.name, DisplayErrorContext(err))
    }

    async fn put_record(&self, table: &str, record: &Record) -> Result<(), StorageError> {
        let key = self.object_key(table, record);
        let body = serde_json::to_vec(record)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .metadata("table", table)
            .metadata("created-at", record.created_at.to_rfc3339())
            .send()
            .await
            .map_err(|e| self.backend_error(e))?;

        debug!(s3_key = %key, "Record uploaded");
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    #[instrument(
        skip(self, record, ctx),
        fields(provider = %self.name, id = %record.id, correlation_id = %ctx.correlation_id)
    )]
    async fn insert(
        &self,
        table: &str,
        record: &Record,
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError> {
        self.put_record(table, record).await
    }

    /// Uploads every object in turn; S3 has no multi-object transaction, so
    /// a failure leaves earlier objects of the batch in place. Keys are
    /// deterministic, which makes a retried batch overwrite rather than
    /// duplicate them.
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
        for record in records {
            self.put_record(table, record).await?;
        }
        metrics::counter!("lifecycle.s3.objects_written").increment(records.len() as u64);
        Ok(())
    }

    fn execute_query(&self, spec: &QuerySpec, _ctx: &ExecutionContext) -> RecordStream {
        let lister = S3Lister {
            name: self.name.clone(),
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            prefix: self.table_prefix(&spec.table),
            page_size: self.list_page_size,
            criteria: spec.criteria.clone(),
        };
        let cursor = ListCursor {
            continuation: None,
            remaining: spec.limit,
            exhausted: false,
        };

        stream::try_unfold(cursor, move |cursor| {
            let lister = lister.clone();
            async move { lister.next_page(cursor).await }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
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
        let spec = QuerySpec::new(table, criteria.clone());
        let keys: Vec<String> = self
            .execute_query(&spec, ctx)
            .map_ok(|record| self.object_key(table, &record))
            .try_collect()
            .await?;

        for key in &keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| self.backend_error(e))?;
        }

        info!(table = %table, deleted_count = keys.len(), "Deleted objects");
        Ok(keys.len() as u64)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| self.backend_error(e))?;
        Ok(())
    }
}

/// Owned listing handle, so query streams do not borrow the provider
#[derive(Clone)]
struct S3Lister {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: String,
    page_size: i32,
    criteria: QueryCriteria,
}

impl S3Lister {
    async fn next_page(
        &self,
        cursor: ListCursor,
    ) -> Result<Option<(Vec<Record>, ListCursor)>, StorageError> {
        if cursor.exhausted || cursor.remaining == Some(0) {
            return Ok(None);
        }

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&self.prefix)
            .max_keys(self.page_size)
            .set_continuation_token(cursor.continuation.clone())
            .send()
            .await
            .map_err(|e| StorageError::backend(&self.name, DisplayErrorContext(e)))?;

        let mut records = Vec::new();
        for key in response.contents().iter().filter_map(|obj| obj.key()) {
            if !key.ends_with(".json") {
                continue;
            }
            let record = self.get_record(key).await?;
            if record.matches(&self.criteria) {
                records.push(record);
            }
        }

        if let Some(remaining) = cursor.remaining {
            records.truncate(remaining);
        }

        let continuation = response.next_continuation_token().map(String::from);
        let next = ListCursor {
            exhausted: continuation.is_none(),
            remaining: cursor.remaining.map(|r| r.saturating_sub(records.len())),
            continuation,
        };

        Ok(Some((records, next)))
    }

    async fn get_record(&self, key: &str) -> Result<Record, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::backend(&self.name, DisplayErrorContext(e)))?;

        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend(&self.name, e))?
            .into_bytes();

        serde_json::from_slice(&bytes).map_err(|e| {
            warn!(s3_key = %key, error = %e, "Object is not a lifecycle record");
            StorageError::MalformedRecord {
                table: self.prefix.clone(),
                id: key.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

fn table_prefix(prefix: &str, table: &str) -> String {
    if prefix.is_empty() {
        format!("{}/", sanitize_path_component(table))
    } else {
        format!("{}/{}/", prefix, sanitize_path_component(table))
    }
}

/// Format: `{prefix}/{table}/{date}/{id}.json`
fn object_key(prefix: &str, table: &str, record: &Record) -> String {
    format!(
        "{table_prefix}{date}/{id}.json",
        table_prefix = table_prefix(prefix, table),
        date = record.created_at.format("%Y-%m-%d"),
        id = sanitize_path_component(&record.id),
    )
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_object_key_partitioning() {
        let record = Record::new("sess-42", Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap());

        assert_eq!(
            object_key("lifecycle", "sessions_archive", &record),
            "lifecycle/sessions_archive/2024-01-15/sess-42.json"
        );
        assert_eq!(
            object_key("", "sessions", &record),
            "sessions/2024-01-15/sess-42.json"
        );
    }

    #[test]
    fn test_table_prefix_ends_with_separator() {
        // "logs" must not list objects of "logs_archive"
        assert_eq!(table_prefix("p", "logs"), "p/logs/");
        assert!(!"p/logs_archive/2024-01-01/x.json".starts_with(&table_prefix("p", "logs")));
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("glasses-001"), "glasses-001");
        assert_eq!(sanitize_path_component("device/path"), "device_path");
        assert_eq!(sanitize_path_component("dev..ice"), "dev__ice");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }
}
