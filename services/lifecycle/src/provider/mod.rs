//! Storage provider contract and its built-in implementations.
//!
//! A provider exposes insert, batch insert, streaming query and predicate
//! delete over named logical tables. Which tier a provider serves is decided
//! when it is registered (see [`crate::registry`]), not by the provider.

use crate::context::ExecutionContext;
use crate::criteria::{QueryCriteria, QuerySpec, Scalar, CREATED_AT_FIELD, ID_FIELD};
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod memory;
pub mod postgres;
pub mod s3;

pub use memory::MemoryProvider;
pub use postgres::PostgresProvider;
pub use s3::S3Provider;

/// Storage tier, ordered from most to least frequently accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTier {
    Hot,
    Warm,
    Cold,
}

impl DataTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataTier::Hot => "hot",
            DataTier::Warm => "warm",
            DataTier::Cold => "cold",
        }
    }
}

impl fmt::Display for DataTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(DataTier::Hot),
            "warm" => Ok(DataTier::Warm),
            "cold" => Ok(DataTier::Cold),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Class of storage technology behind a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnologyClass {
    KeyValueCache,
    Relational,
    Document,
    Warehouse,
    ObjectStore,
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier, unique within a table
    pub id: String,
    /// Creation time, the basis of age thresholds
    pub created_at: DateTime<Utc>,
    /// Payload fields
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a field as a scalar; `id` and `created_at` address the record columns
    pub fn field(&self, name: &str) -> Option<Scalar> {
        match name {
            ID_FIELD => Some(Scalar::Text(self.id.clone())),
            CREATED_AT_FIELD => Some(Scalar::Timestamp(self.created_at)),
            _ => self.fields.get(name).and_then(Scalar::from_json),
        }
    }

    pub fn matches(&self, criteria: &QueryCriteria) -> bool {
        criteria.matches_with(|field| self.field(field))
    }
}

/// Lazy, finite sequence of query results. Not restartable: issue a new
/// query to read again.
pub type RecordStream = BoxStream<'static, Result<Record, StorageError>>;

/// Contract every storage backend implements.
///
/// Criteria follow [`Scalar::compare`]: a field whose stored type cannot be
/// compared with the predicate value (text against a number, say) never
/// matches. Fields compared against timestamps must hold RFC 3339 strings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Insert or replace a single record
    async fn insert(
        &self,
        table: &str,
        record: &Record,
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError>;

    /// Insert or replace a batch of records.
    ///
    /// Implementations should apply the batch atomically where the backend
    /// allows it; on error the caller treats the whole batch as failed.
    async fn insert_batch(
        &self,
        table: &str,
        records: &[Record],
        ctx: &ExecutionContext,
    ) -> Result<(), StorageError>;

    /// Stream the records matching a query
    fn execute_query(&self, spec: &QuerySpec, ctx: &ExecutionContext) -> RecordStream;

    /// Delete the records matching the criteria, returning how many were removed
    async fn delete(
        &self,
        table: &str,
        criteria: &QueryCriteria,
        ctx: &ExecutionContext,
    ) -> Result<u64, StorageError>;

    /// Check connectivity with the backend
    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_field_lookup() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let record = Record::new("s-1", created)
            .with_field("user", "alice")
            .with_field("hits", 12)
            .with_field("tags", serde_json::json!(["a"]));

        assert_eq!(record.field("id"), Some(Scalar::Text("s-1".to_string())));
        assert_eq!(record.field("created_at"), Some(Scalar::Timestamp(created)));
        assert_eq!(record.field("user"), Some(Scalar::Text("alice".to_string())));
        assert_eq!(record.field("hits"), Some(Scalar::Integer(12)));
        assert_eq!(record.field("tags"), None);
        assert_eq!(record.field("missing"), None);
    }

    #[test]
    fn test_record_matches_criteria() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let record = Record::new("s-1", created).with_field("status", "closed");

        let older = QueryCriteria::older_than(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        let closed = older
            .clone()
            .equals("status", Scalar::Text("closed".to_string()));
        let open = older.equals("status", Scalar::Text("open".to_string()));

        assert!(record.matches(&QueryCriteria::all()));
        assert!(record.matches(&closed));
        assert!(!record.matches(&open));
    }

    #[test]
    fn test_mismatched_field_type_never_matches() {
        let created = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let record = Record::new("s-1", created).with_field("hits", 12);

        let as_text = QueryCriteria::all().equals("hits", Scalar::Text("12".to_string()));
        let as_number = QueryCriteria::all().equals("hits", Scalar::Float(12.0));

        assert!(!record.matches(&as_text));
        assert!(record.matches(&as_number));
    }

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in [DataTier::Hot, DataTier::Warm, DataTier::Cold] {
            assert_eq!(tier.to_string().parse::<DataTier>().unwrap(), tier);
        }
        assert!("lukewarm".parse::<DataTier>().is_err());
        assert_eq!(
            serde_json::to_string(&TechnologyClass::KeyValueCache).unwrap(),
            "\"key_value_cache\""
        );
    }
}
