use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata key naming the origin of a request
pub const SOURCE_KEY: &str = "source";

/// Source tag attached to scheduler-driven work
pub const AUTOMATIC_SOURCE: &str = "automatic_lifecycle";

/// Execution context passed with every provider call.
///
/// Carried purely for tracing; nothing in the service branches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller-supplied correlation ID, also used as the operation ID
    pub correlation_id: String,
    /// When the context was created
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Context with a freshly generated correlation ID
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Context used by the background scheduler
    pub fn automatic() -> Self {
        Self::new(format!("lifecycle-{}", Uuid::new_v4()))
            .with_metadata(SOURCE_KEY, AUTOMATIC_SOURCE)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derive a context for a sub-operation.
    ///
    /// The child keeps the parent's metadata and gets a correlation ID of the
    /// form `{parent}/{suffix}`, so sibling operations stay distinct in the
    /// operation tracker.
    pub fn child(&self, suffix: &str) -> Self {
        Self {
            correlation_id: format!("{}/{}", self.correlation_id, suffix),
            timestamp: Utc::now(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.metadata.get(SOURCE_KEY).map(|s| s.as_str())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::generate()
    }
}
