//! Lifecycle Service
//!
//! Data lifecycle management across heterogeneous storage backends. Tables
//! live on one provider at a time; the service moves their records between
//! hot, warm and cold tiers, archives old records and enforces retention
//! policies, either on demand or from a background scheduler.
//!
//! ## Features
//!
//! - **Tiering**: batched, cancellable movement between providers, with the
//!   source delete issued only after every batch is written
//! - **Archival**: copy-then-delete into `<table>_archive` on the archive
//!   provider
//! - **Retention**: declarative policies of age/condition rules, applied per
//!   (policy, table) unit with failures isolated
//! - **Operations API**: inspect and cancel in-flight operations, trigger
//!   cycles manually
//!
//! ## Architecture
//!
//! ```text
//!  Scheduler / Operations API
//!           │
//!           ▼
//! ┌──────────────────┐      ┌──────────────┐
//! │ DataLifecycle    │─────▶│ Operation    │
//! │ Manager          │      │ Tracker      │
//! └──────────────────┘      └──────────────┘
//!           │
//!           ▼
//! ┌──────────────────┐
//! │ Provider         │   routing: table -> provider
//! │ Registry         │
//! └──────────────────┘
//!     │        │        │
//!     ▼        ▼        ▼
//! ┌───────┐ ┌───────┐ ┌───────┐
//! │Memory │ │Postgres│ │  S3  │
//! │ (hot) │ │(warm) │ │(cold) │
//! └───────┘ └───────┘ └───────┘
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod criteria;
pub mod error;
pub mod manager;
pub mod movement;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod results;
pub mod scheduler;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use api::AppState;
pub use config::Config;
pub use context::ExecutionContext;
pub use criteria::{ArchivalCriteria, Predicate, QueryCriteria, QuerySpec, Scalar, TieringCriteria};
pub use error::{LifecycleError, PolicyError, RegistryError, StorageError};
pub use manager::{DataLifecycleManager, ManagerSettings};
pub use policy::{LifecyclePolicy, LifecycleRule, RuleAction, Schedule};
pub use provider::{
    DataTier, MemoryProvider, PostgresProvider, Record, S3Provider, StorageProvider,
    TechnologyClass,
};
pub use registry::{ProviderRegistry, RegisteredProvider};
pub use results::{
    ArchivalResult, CycleReport, RetentionResult, TableRetentionResult, TieringResult,
};
pub use scheduler::SchedulerState;
pub use telemetry::MetricsSnapshot;
pub use tracker::{OperationKind, OperationSnapshot, OperationStatus};
