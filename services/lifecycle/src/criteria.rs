//! Query criteria shared by every storage provider.
//!
//! Criteria are a closed set of predicate shapes combined by conjunction.
//! The core builds them from policy rules or caller input; each provider
//! translates them into its own query mechanism (SQL, object listing
//! filters, in-memory scans) without the core ever seeing that form.

use crate::error::PolicyError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Field holding the record identifier
pub const ID_FIELD: &str = "id";

/// Field holding the record creation time, used by age thresholds
pub const CREATED_AT_FIELD: &str = "created_at";

/// A comparable value used in predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl Scalar {
    /// Parse a literal from a condition string.
    ///
    /// Tries bool, integer, float and RFC 3339 timestamp in that order; quoted
    /// literals are always text.
    pub fn parse_literal(raw: &str) -> Self {
        let raw = raw.trim();
        for quote in ['\'', '"'] {
            if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
                return Scalar::Text(raw[1..raw.len() - 1].to_string());
            }
        }

        if let Ok(b) = raw.parse::<bool>() {
            return Scalar::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Scalar::Integer(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Scalar::Float(f);
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Scalar::Timestamp(ts.with_timezone(&Utc));
        }

        Scalar::Text(raw.to_string())
    }

    /// Convert a JSON field value into a scalar, if it has a scalar shape
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Scalar::Integer)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            _ => None,
        }
    }

    /// Compare two scalars.
    ///
    /// Integers and floats compare numerically; text compares against a
    /// timestamp when it parses as RFC 3339. Any other mix is incomparable.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        use Scalar::*;
        match (self, other) {
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Text(a), Timestamp(b)) => parse_timestamp(a).map(|a| a.cmp(b)),
            (Timestamp(a), Text(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
            _ => None,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// A single predicate over one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// `field == value`
    Equals { field: String, value: Scalar },
    /// `field < value`
    LessThan { field: String, value: Scalar },
    /// `start <= field < end`
    Range {
        field: String,
        start: Scalar,
        end: Scalar,
    },
}

impl Predicate {
    pub fn field(&self) -> &str {
        match self {
            Predicate::Equals { field, .. }
            | Predicate::LessThan { field, .. }
            | Predicate::Range { field, .. } => field,
        }
    }

    /// Evaluate against a field value; a missing or incomparable value never matches
    pub fn matches(&self, actual: Option<&Scalar>) -> bool {
        let Some(actual) = actual else {
            return false;
        };

        match self {
            Predicate::Equals { value, .. } => actual.compare(value) == Some(Ordering::Equal),
            Predicate::LessThan { value, .. } => actual.compare(value) == Some(Ordering::Less),
            Predicate::Range { start, end, .. } => {
                matches!(
                    actual.compare(start),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && actual.compare(end) == Some(Ordering::Less)
            }
        }
    }

    /// Parse a free-form condition.
    ///
    /// Accepted shapes: `field = value`, `field < value` and
    /// `field between start and end`. The operator must directly follow the
    /// field name; `<=`, `>=`, `>`, `!=` and `==` are rejected.
    pub fn parse_condition(raw: &str) -> Result<Self, PolicyError> {
        let invalid = || PolicyError::InvalidCondition(raw.to_string());
        let trimmed = raw.trim();

        let field_end = trimmed
            .find(|c: char| !is_field_char(c))
            .unwrap_or(trimmed.len());
        let field = &trimmed[..field_end];
        if field.is_empty() {
            return Err(invalid());
        }
        let rest = trimmed[field_end..].trim_start();

        if let Some(bounds) = strip_keyword(rest, "between") {
            let and = bounds.to_ascii_lowercase().find(" and ").ok_or_else(invalid)?;
            let start = bounds[..and].trim();
            let end = bounds[and + " and ".len()..].trim();
            if start.is_empty() || end.is_empty() {
                return Err(invalid());
            }
            return Ok(Predicate::Range {
                field: field.to_string(),
                start: Scalar::parse_literal(start),
                end: Scalar::parse_literal(end),
            });
        }

        let (less, value) = if let Some(value) = rest.strip_prefix('<') {
            (true, value)
        } else if let Some(value) = rest.strip_prefix('=') {
            (false, value)
        } else {
            return Err(invalid());
        };
        if value.starts_with(['=', '<', '>']) {
            return Err(invalid());
        }
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid());
        }

        let field = field.to_string();
        let value = Scalar::parse_literal(value);
        Ok(if less {
            Predicate::LessThan { field, value }
        } else {
            Predicate::Equals { field, value }
        })
    }
}

fn is_field_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Strip a case-insensitive keyword followed by whitespace
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    let tail = &input[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && tail.starts_with(char::is_whitespace)).then_some(tail)
}

/// Field names are restricted so providers can embed them safely
pub fn is_valid_field(field: &str) -> bool {
    !field.is_empty() && field.chars().all(is_field_char)
}

/// An immutable conjunction of predicates.
///
/// Empty criteria match every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCriteria {
    predicates: Vec<Predicate>,
}

impl QueryCriteria {
    pub fn all() -> Self {
        Self::default()
    }

    /// Criteria matching records created strictly before `instant`
    pub fn older_than(instant: DateTime<Utc>) -> Self {
        Self::all().less_than(CREATED_AT_FIELD, Scalar::Timestamp(instant))
    }

    pub fn equals(self, field: impl Into<String>, value: Scalar) -> Self {
        self.with(Predicate::Equals {
            field: field.into(),
            value,
        })
    }

    pub fn less_than(self, field: impl Into<String>, value: Scalar) -> Self {
        self.with(Predicate::LessThan {
            field: field.into(),
            value,
        })
    }

    pub fn range(self, field: impl Into<String>, start: Scalar, end: Scalar) -> Self {
        self.with(Predicate::Range {
            field: field.into(),
            start,
            end,
        })
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Conjunction of both criteria
    pub fn and(mut self, other: &QueryCriteria) -> Self {
        self.predicates.extend(other.predicates.iter().cloned());
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Evaluate the criteria given a field lookup
    pub fn matches_with<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<Scalar>,
    {
        self.predicates
            .iter()
            .all(|p| p.matches(lookup(p.field()).as_ref()))
    }
}

/// A query against one logical table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    pub criteria: QueryCriteria,
    /// Maximum number of records to return
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>, criteria: QueryCriteria) -> Self {
        Self {
            table: table.into(),
            criteria,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Criteria for moving data between tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TieringCriteria {
    #[serde(default)]
    pub criteria: QueryCriteria,
    /// Delete moved records from the source once every batch is written
    #[serde(default)]
    pub remove_from_source: bool,
}

impl TieringCriteria {
    pub fn new(criteria: QueryCriteria, remove_from_source: bool) -> Self {
        Self {
            criteria,
            remove_from_source,
        }
    }
}

/// Criteria for archiving data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalCriteria {
    /// Archive records created strictly before this instant
    pub older_than: DateTime<Utc>,
    /// Additional restriction on top of the age threshold
    #[serde(default)]
    pub condition: Option<QueryCriteria>,
    /// Delete archived records from the source afterwards
    #[serde(default)]
    pub remove_after_archive: bool,
}

impl ArchivalCriteria {
    pub fn new(older_than: DateTime<Utc>, remove_after_archive: bool) -> Self {
        Self {
            older_than,
            condition: None,
            remove_after_archive,
        }
    }

    pub fn with_condition(mut self, condition: QueryCriteria) -> Self {
        self.condition = Some(condition);
        self
    }

    /// The query criteria selecting the records to archive
    pub fn to_query_criteria(&self) -> QueryCriteria {
        let criteria = QueryCriteria::older_than(self.older_than);
        match &self.condition {
            Some(condition) => criteria.and(condition),
            None => criteria,
        }
    }
}

/// Parse an age threshold such as `"30_days"` or `"6 months"`.
///
/// Months count as 30 days and years as 365 days.
pub fn parse_age(raw: &str) -> Result<Duration, PolicyError> {
    let trimmed = raw.trim();
    let (amount, unit) = trimmed
        .split_once(|c: char| c == '_' || c.is_whitespace())
        .ok_or_else(|| PolicyError::InvalidAge(raw.to_string()))?;

    let amount: i64 = amount
        .trim()
        .parse()
        .map_err(|_| PolicyError::InvalidAge(raw.to_string()))?;
    if amount < 0 {
        return Err(PolicyError::InvalidAge(raw.to_string()));
    }

    let days_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "hour" | "hours" => {
            return Duration::try_hours(amount)
                .ok_or_else(|| PolicyError::InvalidAge(raw.to_string()))
        }
        "day" | "days" => 1,
        "week" | "weeks" => 7,
        "month" | "months" => 30,
        "year" | "years" => 365,
        other => return Err(PolicyError::UnsupportedUnit(other.to_string())),
    };

    amount
        .checked_mul(days_per_unit)
        .and_then(Duration::try_days)
        .ok_or_else(|| PolicyError::InvalidAge(raw.to_string()))
}

/// Resolve an age threshold against `now` into an absolute cutoff instant
pub fn resolve_age(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, PolicyError> {
    let age = parse_age(raw)?;
    now.checked_sub_signed(age)
        .ok_or_else(|| PolicyError::InvalidAge(raw.to_string()))
}
