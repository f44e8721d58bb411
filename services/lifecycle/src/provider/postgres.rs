use super::{Record, RecordStream, StorageProvider};
use crate::config::DatabaseConfig;
use crate::context::ExecutionContext;
use crate::criteria::{
    is_valid_field, Predicate, QueryCriteria, QuerySpec, Scalar, CREATED_AT_FIELD, ID_FIELD,
};
use crate::error::StorageError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, instrument};

const SELECT_RECORDS: &str =
    "SELECT id, created_at, fields FROM lifecycle_records WHERE table_name = ";
const DELETE_RECORDS: &str = "DELETE FROM lifecycle_records WHERE table_name = ";
const UPSERT_RECORD: &str = r#"
    INSERT INTO lifecycle_records (table_name, id, created_at, fields, updated_at)
    VALUES ($1, $2, $3, $4, NOW())
    ON CONFLICT (table_name, id) DO UPDATE
    SET created_at = EXCLUDED.created_at,
        fields = EXCLUDED.fields,
        updated_at = NOW()
"#;

/// Row shape of `lifecycle_records`
#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    created_at: DateTime<Utc>,
    fields: Json<serde_json::Map<String, serde_json::Value>>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            fields: row.fields.0,
        }
    }
}

/// Keyset pagination state for streaming queries
#[derive(Debug, Clone)]
struct PageCursor {
    after: Option<(DateTime<Utc>, String)>,
    remaining: Option<usize>,
    exhausted: bool,
}

/// Relational provider backed by PostgreSQL.
///
/// Every logical table lives in the shared `lifecycle_records` table,
/// partitioned by `table_name`, with the payload stored as JSONB.
pub struct PostgresProvider {
    name: String,
    pool: PgPool,
    page_size: i64,
}

impl PostgresProvider {
    /// Create a new provider with its own connection pool
    pub async fn new(name: impl Into<String>, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self::from_pool(name, pool, config.page_size))
    }

    pub fn from_pool(name: impl Into<String>, pool: PgPool, page_size: i64) -> Self {
        Self {
            name: name.into(),
            pool,
            page_size: page_size.max(1),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn backend_error(&self, err: sqlx::Error) -> StorageError {
        StorageError::backend(&self.name, err)
    }
}

#[async_trait]
impl StorageProvider for PostgresProvider {
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
        sqlx::query(UPSERT_RECORD)
            .bind(table)
            .bind(&record.id)
            .bind(record.created_at)
            .bind(Json(&record.fields))
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_error(e))?;

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
        let mut tx = self.pool.begin().await.map_err(|e| self.backend_error(e))?;

        for record in records {
            sqlx::query(UPSERT_RECORD)
                .bind(table)
                .bind(&record.id)
                .bind(record.created_at)
                .bind(Json(&record.fields))
                .execute(&mut *tx)
                .await
                .map_err(|e| self.backend_error(e))?;
        }

        tx.commit().await.map_err(|e| self.backend_error(e))?;

        debug!(table = %table, count = records.len(), "Batch committed");
        metrics::counter!("lifecycle.postgres.records_written").increment(records.len() as u64);

        Ok(())
    }

    fn execute_query(&self, spec: &QuerySpec, _ctx: &ExecutionContext) -> RecordStream {
        let pool = self.pool.clone();
        let name = self.name.clone();
        let spec = spec.clone();
        let page_size = self.page_size;
        let cursor = PageCursor {
            after: None,
            remaining: spec.limit,
            exhausted: false,
        };

        stream::try_unfold(cursor, move |cursor| {
            let pool = pool.clone();
            let name = name.clone();
            let spec = spec.clone();
            async move { fetch_page(&name, &pool, &spec, page_size, cursor).await }
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
        let mut qb = filtered(DELETE_RECORDS, table, criteria)?;

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_error(e))?;

        let count = result.rows_affected();
        info!(table = %table, deleted_count = count, "Deleted records");

        Ok(count)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_error(e))?;
        Ok(())
    }
}

/// Fetch one page of a streaming query
async fn fetch_page(
    name: &str,
    pool: &PgPool,
    spec: &QuerySpec,
    page_size: i64,
    cursor: PageCursor,
) -> Result<Option<(Vec<Record>, PageCursor)>, StorageError> {
    if cursor.exhausted || cursor.remaining == Some(0) {
        return Ok(None);
    }

    let limit = match cursor.remaining {
        Some(remaining) => page_size.min(remaining as i64),
        None => page_size,
    };

    let mut qb = page_query(spec, cursor.after.as_ref(), limit)?;
    let rows: Vec<RecordRow> = qb
        .build_query_as()
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::backend(name, e))?;

    if rows.is_empty() {
        return Ok(None);
    }

    let fetched = rows.len();
    let records: Vec<Record> = rows.into_iter().map(Record::from).collect();
    let after = records.last().map(|r| (r.created_at, r.id.clone()));

    Ok(Some((
        records,
        PageCursor {
            after,
            remaining: cursor.remaining.map(|r| r.saturating_sub(fetched)),
            exhausted: (fetched as i64) < limit,
        },
    )))
}

fn page_query<'a>(
    spec: &QuerySpec,
    after: Option<&(DateTime<Utc>, String)>,
    limit: i64,
) -> Result<QueryBuilder<'a, Postgres>, StorageError> {
    let mut qb = filtered(SELECT_RECORDS, &spec.table, &spec.criteria)?;

    if let Some((created_at, id)) = after {
        qb.push(" AND (created_at, id) > (");
        qb.push_bind(*created_at);
        qb.push(", ");
        qb.push_bind(id.clone());
        qb.push(")");
    }

    qb.push(" ORDER BY created_at, id LIMIT ");
    qb.push_bind(limit);

    Ok(qb)
}

/// Start a statement scoped to one logical table and append the criteria
fn filtered<'a>(
    prefix: &str,
    table: &str,
    criteria: &QueryCriteria,
) -> Result<QueryBuilder<'a, Postgres>, StorageError> {
    let mut qb = QueryBuilder::new(prefix);
    qb.push_bind(table.to_string());

    for predicate in criteria.predicates() {
        qb.push(" AND ");
        push_predicate(&mut qb, predicate)?;
    }

    Ok(qb)
}

fn push_predicate(
    qb: &mut QueryBuilder<'_, Postgres>,
    predicate: &Predicate,
) -> Result<(), StorageError> {
    match predicate {
        Predicate::Equals { field, value } => {
            push_field(qb, field, value)?;
            qb.push(" = ");
            push_scalar(qb, field, value)?;
        }
        Predicate::LessThan { field, value } => {
            push_field(qb, field, value)?;
            qb.push(" < ");
            push_scalar(qb, field, value)?;
        }
        Predicate::Range { field, start, end } => {
            qb.push("(");
            push_field(qb, field, start)?;
            qb.push(" >= ");
            push_scalar(qb, field, start)?;
            qb.push(" AND ");
            push_field(qb, field, end)?;
            qb.push(" < ");
            push_scalar(qb, field, end)?;
            qb.push(")");
        }
    }
    Ok(())
}

/// Column expression for a field, cast to match the compared value
fn push_field(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    value: &Scalar,
) -> Result<(), StorageError> {
    match field {
        ID_FIELD => {
            qb.push("id");
        }
        CREATED_AT_FIELD => {
            qb.push("created_at");
        }
        _ => {
            if !is_valid_field(field) {
                return Err(StorageError::InvalidCriteria(format!(
                    "invalid field name '{}'",
                    field
                )));
            }
            // A field of another JSON type yields NULL and never matches,
            // like an incomparable scalar in `Scalar::compare`
            let (json_type, cast) = match value {
                Scalar::Text(_) => ("string", " COLLATE \"C\""),
                Scalar::Integer(_) | Scalar::Float(_) => ("number", "::double precision"),
                Scalar::Bool(_) => ("boolean", "::boolean"),
                Scalar::Timestamp(_) => ("string", "::timestamptz"),
            };
            qb.push(format!(
                "(CASE WHEN jsonb_typeof(fields->'{field}') = '{json_type}' \
                 THEN (fields->>'{field}'){cast} END)"
            ));
        }
    }
    Ok(())
}

fn push_scalar(
    qb: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    value: &Scalar,
) -> Result<(), StorageError> {
    if field == CREATED_AT_FIELD {
        let ts = match value {
            Scalar::Timestamp(ts) => *ts,
            Scalar::Text(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| StorageError::InvalidCriteria(format!("created_at: {}", e)))?,
            other => {
                return Err(StorageError::InvalidCriteria(format!(
                    "created_at cannot be compared with {:?}",
                    other
                )))
            }
        };
        qb.push_bind(ts);
        return Ok(());
    }

    if field == ID_FIELD {
        let id = match value {
            Scalar::Text(s) => s.clone(),
            Scalar::Integer(i) => i.to_string(),
            other => {
                return Err(StorageError::InvalidCriteria(format!(
                    "id cannot be compared with {:?}",
                    other
                )))
            }
        };
        qb.push_bind(id);
        return Ok(());
    }

    match value {
        Scalar::Text(s) => qb.push_bind(s.clone()),
        Scalar::Integer(i) => qb.push_bind(*i as f64),
        Scalar::Float(f) => qb.push_bind(*f),
        Scalar::Bool(b) => qb.push_bind(*b),
        Scalar::Timestamp(ts) => qb.push_bind(*ts),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filter_sql_for_age_and_condition() {
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let criteria = QueryCriteria::older_than(cutoff)
            .equals("status", Scalar::Text("closed".to_string()));

        let qb = filtered(DELETE_RECORDS, "sessions", &criteria).unwrap();

        assert_eq!(
            qb.sql(),
            "DELETE FROM lifecycle_records WHERE table_name = $1 \
             AND created_at < $2 AND (CASE WHEN jsonb_typeof(fields->'status') = 'string' \
             THEN (fields->>'status') COLLATE \"C\" END) = $3"
        );
    }

    #[test]
    fn test_numeric_range_is_cast() {
        let criteria = QueryCriteria::all().range("score", Scalar::Integer(1), Scalar::Float(9.5));

        let qb = filtered(SELECT_RECORDS, "scores", &criteria).unwrap();

        let score = "(CASE WHEN jsonb_typeof(fields->'score') = 'number' \
                     THEN (fields->>'score')::double precision END)";
        assert!(qb
            .sql()
            .ends_with(&format!("AND ({score} >= $2 AND {score} < $3)")));
    }

    #[test]
    fn test_field_of_other_json_type_never_matches() {
        let criteria = QueryCriteria::all()
            .equals("hits", Scalar::Text("12".to_string()))
            .less_than("active", Scalar::Bool(true));

        let qb = filtered(SELECT_RECORDS, "t", &criteria).unwrap();

        assert!(qb
            .sql()
            .contains("CASE WHEN jsonb_typeof(fields->'hits') = 'string' THEN"));
        assert!(qb
            .sql()
            .contains("CASE WHEN jsonb_typeof(fields->'active') = 'boolean' THEN"));
    }

    #[test]
    fn test_page_query_uses_keyset_cursor() {
        let spec = QuerySpec::new("sessions", QueryCriteria::all());
        let after = (Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), "s-9".to_string());

        let qb = page_query(&spec, Some(&after), 500).unwrap();

        assert_eq!(
            qb.sql(),
            "SELECT id, created_at, fields FROM lifecycle_records WHERE table_name = $1 \
             AND (created_at, id) > ($2, $3) ORDER BY created_at, id LIMIT $4"
        );
    }

    #[test]
    fn test_rejects_unsafe_field_names() {
        let criteria = QueryCriteria::all().equals("x' OR '1'='1", Scalar::Integer(1));
        assert!(matches!(
            filtered(SELECT_RECORDS, "t", &criteria),
            Err(StorageError::InvalidCriteria(_))
        ));
    }

    #[test]
    fn test_created_at_requires_timestamp() {
        let criteria = QueryCriteria::all().less_than(CREATED_AT_FIELD, Scalar::Bool(true));
        assert!(filtered(SELECT_RECORDS, "t", &criteria).is_err());
    }
}
