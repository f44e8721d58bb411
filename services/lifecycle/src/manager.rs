//! The data lifecycle manager.
//!
//! Owns the operation tracker, the metrics and the background scheduler,
//! and drives tiering, archival and retention against the providers of a
//! shared [`ProviderRegistry`]. Operation methods never return errors: every
//! failure is logged and folded into the operation's result.

use crate::config::{Config, LifecycleConfig};
use crate::context::ExecutionContext;
use crate::criteria::{ArchivalCriteria, QuerySpec, TieringCriteria};
use crate::error::{LifecycleError, PolicyError, RegistryError};
use crate::movement::DataMovement;
use crate::policy::{LifecyclePolicy, RuleAction, Schedule};
use crate::provider::DataTier;
use crate::registry::ProviderRegistry;
use crate::results::{
    ArchivalResult, CycleReport, RetentionResult, TableRetentionResult, TieringResult,
};
use crate::scheduler::{self, CycleRunner, SchedulerHandle, SchedulerState, SchedulerTiming};
use crate::telemetry::{LifecycleMetrics, MetricsSnapshot};
use crate::tracker::{OperationKind, OperationSnapshot, OperationTracker};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Tuning for lifecycle operations and the scheduler
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub batch_size: usize,
    /// Whether scheduled tiering removes moved records from the source
    pub remove_from_source: bool,
    pub max_concurrent_operations: usize,
    pub schedule: Schedule,
    pub error_backoff: Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &LifecycleConfig) -> Result<Self, PolicyError> {
        Ok(Self {
            batch_size: config.batch_size.max(1),
            remove_from_source: config.remove_from_source,
            max_concurrent_operations: config.max_concurrent_operations.max(1),
            schedule: Schedule::parse(&config.schedule)?,
            error_backoff: Duration::from_secs(config.error_backoff_secs),
        })
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            remove_from_source: true,
            max_concurrent_operations: 4,
            schedule: Schedule::Daily,
            error_backoff: Duration::from_secs(3600),
        }
    }
}

/// Health of one registered provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Running tally of one archival, kept outside the fallible body so a
/// failure can still report it
#[derive(Debug, Default)]
struct ArchiveProgress {
    archived: u64,
    removed: u64,
    location: Option<String>,
}

/// Running tally of one retention unit
#[derive(Debug, Default)]
struct RetentionTally {
    deleted: u64,
    archived: u64,
}

pub struct DataLifecycleManager {
    registry: Arc<ProviderRegistry>,
    policies: Vec<LifecyclePolicy>,
    settings: ManagerSettings,
    tracker: Arc<OperationTracker>,
    metrics: Arc<LifecycleMetrics>,
    /// Root of every operation and scheduler token
    shutdown: CancellationToken,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl DataLifecycleManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        policies: Vec<LifecyclePolicy>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            policies,
            settings,
            tracker: Arc::new(OperationTracker::new()),
            metrics: Arc::new(LifecycleMetrics::new()),
            shutdown: CancellationToken::new(),
            scheduler: Mutex::new(None),
        }
    }

    /// Build a manager from configuration, validating every policy up front
    pub fn from_config(config: &Config, registry: Arc<ProviderRegistry>) -> anyhow::Result<Self> {
        let settings = ManagerSettings::from_config(&config.lifecycle)?;
        for policy in &config.policies {
            policy.validate()?;
        }
        Ok(Self::new(registry, config.policies.clone(), settings))
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &[LifecyclePolicy] {
        &self.policies
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn operations(&self) -> Vec<OperationSnapshot> {
        self.tracker.snapshot()
    }

    /// Request cancellation of an in-flight operation
    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        self.tracker.cancel(operation_id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn move_to_hot_tier(
        &self,
        table: &str,
        criteria: &TieringCriteria,
        ctx: &ExecutionContext,
    ) -> TieringResult {
        self.move_to_tier(table, DataTier::Hot, criteria, ctx).await
    }

    pub async fn move_to_warm_tier(
        &self,
        table: &str,
        criteria: &TieringCriteria,
        ctx: &ExecutionContext,
    ) -> TieringResult {
        self.move_to_tier(table, DataTier::Warm, criteria, ctx).await
    }

    pub async fn move_to_cold_tier(
        &self,
        table: &str,
        criteria: &TieringCriteria,
        ctx: &ExecutionContext,
    ) -> TieringResult {
        self.move_to_tier(table, DataTier::Cold, criteria, ctx).await
    }

    /// Move the matching records of a table to the first provider of `tier`.
    ///
    /// A table whose current provider already serves `tier` is left alone
    /// and reported as a successful move of zero records. After a whole-table
    /// move with source removal the table is routed to its new provider.
    #[instrument(skip(self, criteria, ctx), fields(operation_id = %ctx.correlation_id))]
    pub async fn move_to_tier(
        &self,
        table: &str,
        tier: DataTier,
        criteria: &TieringCriteria,
        ctx: &ExecutionContext,
    ) -> TieringResult {
        let started = Instant::now();
        let operation_id = ctx.correlation_id.clone();

        match self.try_move(table, tier, criteria, ctx).await {
            Ok((moved, message)) => {
                info!(table = %table, tier = %tier, records = moved, "{}", message);
                TieringResult::success(operation_id, message, moved, started.elapsed())
            }
            Err(e) => {
                error!(
                    table = %table,
                    tier = %tier,
                    operation_id = %operation_id,
                    records_processed = e.processed(),
                    error = %e,
                    "Tiering failed"
                );
                TieringResult::failure(
                    operation_id,
                    e.to_string(),
                    e.processed(),
                    started.elapsed(),
                )
            }
        }
    }

    async fn try_move(
        &self,
        table: &str,
        tier: DataTier,
        criteria: &TieringCriteria,
        ctx: &ExecutionContext,
    ) -> Result<(u64, String), LifecycleError> {
        let targets = self.registry.providers_for_tier(tier);
        let current = self.registry.provider_for_table(table)?;

        if targets.iter().any(|p| p.name == current.name) {
            return Ok((0, format!("Table {} already resides in the {} tier", table, tier)));
        }
        let target = targets
            .first()
            .ok_or_else(|| RegistryError::NoProviderForTier(tier.to_string()))?;

        let mut guard = self.tracker.register(
            ctx.correlation_id.clone(),
            OperationKind::Tiering,
            table,
            &self.shutdown,
        )?;

        let movement = DataMovement {
            source: current.provider.as_ref(),
            target: target.provider.as_ref(),
            table,
            batch_size: self.settings.batch_size,
        };
        let moved = movement.run(criteria, guard.operation(), ctx).await?;
        guard.set_success(true);
        self.metrics.record_moved(moved);

        if criteria.criteria.is_empty() && criteria.remove_from_source {
            self.registry.rebind(table, &target.name)?;
        }

        Ok((
            moved,
            format!("Moved {} records from {} to {}", moved, current.name, target.name),
        ))
    }

    /// Copy matching records of a table into `<table>_archive` on the archive
    /// provider, then optionally delete them from the source.
    ///
    /// The source delete is issued only once every matching record has been
    /// written to the archive.
    #[instrument(skip(self, criteria, ctx), fields(operation_id = %ctx.correlation_id))]
    pub async fn archive(
        &self,
        table: &str,
        criteria: &ArchivalCriteria,
        ctx: &ExecutionContext,
    ) -> ArchivalResult {
        let started = Instant::now();
        let operation_id = ctx.correlation_id.clone();
        let mut progress = ArchiveProgress::default();

        match self.try_archive(table, criteria, ctx, &mut progress).await {
            Ok(location) => {
                info!(
                    table = %table,
                    records_archived = progress.archived,
                    records_removed = progress.removed,
                    location = %location,
                    "Archival completed"
                );
                ArchivalResult::success(
                    operation_id,
                    progress.archived,
                    progress.removed,
                    location,
                    started.elapsed(),
                )
            }
            Err(e) => {
                error!(
                    table = %table,
                    operation_id = %operation_id,
                    records_archived = progress.archived,
                    error = %e,
                    "Archival failed"
                );
                ArchivalResult::failure(
                    operation_id,
                    e,
                    progress.archived,
                    progress.location,
                    started.elapsed(),
                )
            }
        }
    }

    async fn try_archive(
        &self,
        table: &str,
        criteria: &ArchivalCriteria,
        ctx: &ExecutionContext,
        progress: &mut ArchiveProgress,
    ) -> Result<String, LifecycleError> {
        let source = self.registry.provider_for_table(table)?;
        let archive = self.registry.archive_provider()?;
        let archive_table = format!("{}_archive", table);
        let location = format!("{}/{}", archive.name, archive_table);
        progress.location = Some(location.clone());

        let mut guard = self.tracker.register(
            ctx.correlation_id.clone(),
            OperationKind::Archival,
            table,
            &self.shutdown,
        )?;

        let query_criteria = criteria.to_query_criteria();
        let spec = QuerySpec::new(table, query_criteria.clone());
        let mut chunks = source
            .provider
            .execute_query(&spec, ctx)
            .chunks(self.settings.batch_size.max(1));

        while let Some(chunk) = chunks.next().await {
            guard.operation().check_cancelled()?;
            for record in chunk {
                let record = record?;
                archive.provider.insert(&archive_table, &record, ctx).await?;
                progress.archived += 1;
                self.metrics.record_archived(1);
            }
        }

        if criteria.remove_after_archive && progress.archived > 0 {
            guard.operation().check_cancelled()?;
            let removed = source.provider.delete(table, &query_criteria, ctx).await?;
            progress.removed = removed;
            self.metrics.record_deleted(removed);
        }

        guard.set_success(true);
        Ok(location)
    }

    /// Apply the archive and delete rules of every policy to every table.
    ///
    /// Each (policy, table) pair is an isolated unit: a failing unit is
    /// recorded and the others proceed. Units run concurrently up to
    /// `max_concurrent_operations`, reported in policy order.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id))]
    pub async fn apply_retention_policies(&self, ctx: &ExecutionContext) -> RetentionResult {
        let units: Vec<_> = self
            .policies
            .iter()
            .flat_map(|policy| {
                policy
                    .tables
                    .iter()
                    .map(move |table| self.apply_retention_unit(policy, table, ctx))
            })
            .collect();

        let table_results: Vec<TableRetentionResult> = stream::iter(units)
            .buffered(self.settings.max_concurrent_operations.max(1))
            .collect()
            .await;

        let result = RetentionResult::from_tables(table_results);
        for failed in result.failed_tables() {
            warn!(
                policy = %failed.policy,
                table = %failed.table,
                error = failed.error.as_deref().unwrap_or_default(),
                "Retention failed for table"
            );
        }
        info!(
            tables_processed = result.tables_processed,
            successful_tables = result.successful_tables,
            records_deleted = result.total_records_deleted,
            "Retention sweep completed"
        );
        result
    }

    async fn apply_retention_unit(
        &self,
        policy: &LifecyclePolicy,
        table: &str,
        ctx: &ExecutionContext,
    ) -> TableRetentionResult {
        let unit_ctx = ctx.child(&format!("retention/{}/{}", policy.name, table));
        let mut tally = RetentionTally::default();
        let outcome = self.try_retention_unit(policy, table, &unit_ctx, &mut tally).await;

        if let Err(e) = &outcome {
            error!(
                policy = %policy.name,
                table = %table,
                operation_id = %unit_ctx.correlation_id,
                error = %e,
                "Retention unit failed"
            );
        }

        TableRetentionResult {
            table: table.to_string(),
            policy: policy.name.clone(),
            success: outcome.is_ok(),
            records_deleted: tally.deleted,
            records_archived: tally.archived,
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    async fn try_retention_unit(
        &self,
        policy: &LifecyclePolicy,
        table: &str,
        ctx: &ExecutionContext,
        tally: &mut RetentionTally,
    ) -> Result<(), LifecycleError> {
        let mut guard = self.tracker.register(
            ctx.correlation_id.clone(),
            OperationKind::Retention,
            table,
            &self.shutdown,
        )?;
        let now = Utc::now();

        for (index, rule) in policy.rules.iter().enumerate() {
            guard.operation().check_cancelled()?;
            match rule.action {
                RuleAction::Delete => {
                    let criteria = rule.criteria_at(now)?;
                    let provider = self.registry.provider_for_table(table)?;
                    let deleted = provider.provider.delete(table, &criteria, ctx).await?;
                    tally.deleted += deleted;
                    self.metrics.record_deleted(deleted);
                    info!(
                        table = %table,
                        rule = index,
                        records_deleted = deleted,
                        "Retention delete applied"
                    );
                }
                RuleAction::Archive => {
                    let criteria = rule.archival_criteria_at(now, true)?;
                    let result = self
                        .archive(table, &criteria, &ctx.child(&format!("archive-{}", index)))
                        .await;
                    tally.archived += result.records_archived;
                    tally.deleted += result.records_removed;
                    if !result.success {
                        return Err(LifecycleError::Archival {
                            table: table.to_string(),
                            message: result.error.unwrap_or(result.message),
                        });
                    }
                }
                // Tiering rules run in the cycle's tiering phase
                RuleAction::MoveToColdStorage => {}
            }
        }

        guard.set_success(true);
        Ok(())
    }

    /// Run one lifecycle cycle: retention, then every `move_to_cold_storage` rule.
    ///
    /// Per-table failures are reported inside the [`CycleReport`]. The cycle
    /// itself fails only on an invalid policy or on shutdown.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id))]
    pub async fn run_cycle(&self, ctx: &ExecutionContext) -> Result<CycleReport, LifecycleError> {
        let started_at = Utc::now();
        let started = Instant::now();

        for policy in &self.policies {
            policy.validate()?;
        }
        self.ensure_running(ctx)?;

        let retention = self.apply_retention_policies(ctx).await;
        self.ensure_running(ctx)?;

        let now = Utc::now();
        let mut tiering = Vec::new();
        for policy in &self.policies {
            for table in &policy.tables {
                for (index, rule) in policy.rules.iter().enumerate() {
                    if rule.action != RuleAction::MoveToColdStorage {
                        continue;
                    }
                    self.ensure_running(ctx)?;
                    let criteria = rule.tiering_criteria_at(now, self.settings.remove_from_source)?;
                    let op_ctx = ctx.child(&format!("tiering/{}/{}/{}", policy.name, table, index));
                    tiering.push(self.move_to_cold_tier(table, &criteria, &op_ctx).await);
                }
            }
        }

        let report = CycleReport {
            started_at,
            retention,
            tiering,
            elapsed: started.elapsed(),
        };
        self.metrics.record_cycle();
        metrics::histogram!("lifecycle.cycle.duration_seconds")
            .record(report.elapsed.as_secs_f64());

        if report.failed_tiering() > 0 {
            warn!(failed = report.failed_tiering(), "Some tiering operations failed");
        }
        Ok(report)
    }

    fn ensure_running(&self, ctx: &ExecutionContext) -> Result<(), LifecycleError> {
        if self.shutdown.is_cancelled() {
            Err(LifecycleError::Cancelled(ctx.correlation_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Start the background scheduler; returns false if it is already running
    pub fn start_scheduler(self: &Arc<Self>) -> bool {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() || self.shutdown.is_cancelled() {
            return false;
        }

        let timing = SchedulerTiming {
            interval: self.settings.schedule.interval(),
            error_backoff: self.settings.error_backoff,
        };
        let runner: Arc<dyn CycleRunner> = self.clone();
        *scheduler = Some(scheduler::spawn(
            runner,
            self.metrics.clone(),
            timing,
            self.shutdown.child_token(),
        ));
        true
    }

    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.scheduler.lock().as_ref().map(|handle| handle.state())
    }

    /// Stop the scheduler and every in-flight operation.
    ///
    /// Cancels the root token so running operations stop at their next batch
    /// boundary, waits for the scheduler task, then cancels and clears
    /// whatever is still tracked. Providers are left open.
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle manager");
        self.shutdown.cancel();

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let cancelled = self.tracker.cancel_all();
        self.tracker.clear();
        info!(cancelled_operations = cancelled, "Lifecycle manager stopped");
    }

    /// Run every provider's health check
    pub async fn provider_health(&self) -> Vec<ProviderHealth> {
        let checks = self.registry.all().iter().map(|handle| async move {
            let outcome = handle.provider.health_check().await;
            ProviderHealth {
                name: handle.name.clone(),
                healthy: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            }
        });
        futures::future::join_all(checks).await
    }
}

#[async_trait]
impl CycleRunner for DataLifecycleManager {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CycleReport, LifecycleError> {
        self.run_cycle(ctx).await
    }
}
