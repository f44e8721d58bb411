use crate::policy::{LifecyclePolicy, Schedule};
use crate::provider::{DataTier, TechnologyClass};
use serde::Deserialize;
use std::collections::HashMap;

/// Main configuration for the lifecycle service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Operations API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// PostgreSQL configuration, required by `postgres` providers
    pub database: Option<DatabaseConfig>,
    /// S3 configuration, required by `s3` providers
    pub s3: Option<S3Config>,
    /// Scheduler and operation tuning
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Storage providers, in registration order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Logical table -> provider name
    #[serde(default)]
    pub routing: HashMap<String, String>,
    /// Provider owning tables absent from `routing`
    pub default_provider: Option<String>,
    /// Provider receiving archived records; defaults to the first cold provider
    pub archive_provider: Option<String>,
    /// Lifecycle policies
    #[serde(default)]
    pub policies: Vec<LifecyclePolicy>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Lifecycle scheduler and operation settings
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// `daily`, `hourly` or an interval such as `6_hours`
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Run the background scheduler
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
    /// Records per batch during movement and archival
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay after a failed cycle, in seconds
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Whether scheduled tiering removes moved records from the source
    #[serde(default = "default_true")]
    pub remove_from_source: bool,
    /// Retention units run concurrently within one cycle
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,
}

/// Kind of storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Memory,
    Postgres,
    S3,
}

impl ProviderKind {
    pub fn default_technology(&self) -> TechnologyClass {
        match self {
            ProviderKind::Memory => TechnologyClass::KeyValueCache,
            ProviderKind::Postgres => TechnologyClass::Relational,
            ProviderKind::S3 => TechnologyClass::ObjectStore,
        }
    }
}

/// A storage provider to register
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// Technology class, defaults by kind
    pub technology: Option<TechnologyClass>,
    /// Tiers this provider serves
    pub tiers: Vec<DataTier>,
}

impl ProviderConfig {
    pub fn technology(&self) -> TechnologyClass {
        self.technology
            .unwrap_or_else(|| self.kind.default_technology())
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
    /// Rows fetched per page by streaming queries
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding cold and archived records
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Key prefix for all lifecycle objects
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    /// Keys listed per request by streaming queries
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i32,
}

/// API configuration for the operations endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "lifecycle-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_schedule() -> String {
    "daily".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_error_backoff_secs() -> u64 {
    3600 // 1 hour
}

fn default_max_concurrent_operations() -> usize {
    4
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_page_size() -> i64 {
    500
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_prefix() -> String {
    "lifecycle".to_string()
}

fn default_list_page_size() -> i32 {
    1000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "lifecycle-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/lifecycle").required(false))
            .add_source(config::File::with_name("/etc/lifecycle/lifecycle").required(false))
            // LIFECYCLE__LIFECYCLE__BATCH_SIZE -> lifecycle.batch_size
            .add_source(
                config::Environment::with_prefix("LIFECYCLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        self.schedule()?;

        if self.lifecycle.batch_size == 0 {
            anyhow::bail!("lifecycle.batch_size must be greater than zero");
        }

        for provider in &self.providers {
            match provider.kind {
                ProviderKind::Postgres if self.database.is_none() => {
                    anyhow::bail!("provider {} needs a [database] section", provider.name)
                }
                ProviderKind::S3 if self.s3.is_none() => {
                    anyhow::bail!("provider {} needs an [s3] section", provider.name)
                }
                _ => {}
            }
            if provider.tiers.is_empty() {
                anyhow::bail!("provider {} serves no tier", provider.name);
            }
        }

        for policy in &self.policies {
            policy.validate()?;
        }

        Ok(())
    }

    pub fn schedule(&self) -> anyhow::Result<Schedule> {
        Ok(Schedule::parse(&self.lifecycle.schedule)?)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            scheduler_enabled: true,
            batch_size: default_batch_size(),
            error_backoff_secs: default_error_backoff_secs(),
            remove_from_source: true,
            max_concurrent_operations: default_max_concurrent_operations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RuleAction;

    const SAMPLE: &str = r#"
        default_provider = "warehouse"

        [lifecycle]
        schedule = "hourly"
        batch_size = 250

        [s3]
        bucket = "lifecycle-archive"

        [[providers]]
        name = "cache"
        kind = "memory"
        tiers = ["hot"]

        [[providers]]
        name = "warehouse"
        kind = "memory"
        technology = "warehouse"
        tiers = ["warm"]

        [[providers]]
        name = "archive"
        kind = "s3"
        tiers = ["cold"]

        [routing]
        sessions = "cache"

        [[policies]]
        name = "session-retention"
        tables = ["sessions"]

        [[policies.rules]]
        action = "move_to_cold_storage"
        age = "30_days"

        [[policies.rules]]
        action = "delete"
        age = "1_year"
    "#;

    #[test]
    fn test_default_values() {
        assert_eq!(default_batch_size(), 1000);
        assert_eq!(default_error_backoff_secs(), 3600);
        assert_eq!(default_page_size(), 500);
    }

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.schedule().unwrap(), Schedule::Hourly);
        assert_eq!(config.lifecycle.batch_size, 250);
        assert!(config.lifecycle.remove_from_source);
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.providers[1].technology(), TechnologyClass::Warehouse);
        assert_eq!(config.providers[2].technology(), TechnologyClass::ObjectStore);
        assert_eq!(config.routing.get("sessions").map(String::as_str), Some("cache"));
        assert_eq!(config.s3.as_ref().unwrap().prefix, "lifecycle");
        assert_eq!(config.policies[0].rules[0].action, RuleAction::MoveToColdStorage);
        assert_eq!(config.service.name, "lifecycle-service");
    }

    #[test]
    fn test_s3_provider_requires_section() {
        let raw = r#"
            [[providers]]
            name = "archive"
            kind = "s3"
            tiers = ["cold"]
        "#;

        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("[s3]"));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let raw = r#"
            [lifecycle]
            schedule = "whenever"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }
}
