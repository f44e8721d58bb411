//! Background lifecycle scheduler.
//!
//! ```text
//! Idle -> Waiting(interval) -> Running -> Waiting(interval | backoff) -> ... -> Stopped
//! ```
//!
//! One task drives the cycles. A failed cycle is counted and followed by the
//! error backoff instead of the normal interval; the loop itself never exits
//! on a cycle error. `Stopped` is reached only through cancellation, and a
//! cycle cut short by that cancellation is not counted as an error.

use crate::context::ExecutionContext;
use crate::error::LifecycleError;
use crate::results::CycleReport;
use crate::telemetry::LifecycleMetrics;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Something able to run one lifecycle cycle
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CycleReport, LifecycleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Waiting { delay_secs: u64 },
    Running,
    Stopped,
}

/// Timing of the scheduler loop
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    pub interval: Duration,
    pub error_backoff: Duration,
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    state: watch::Receiver<SchedulerState>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Cancel the loop and wait for the task to exit
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

/// Spawn the scheduler loop.
///
/// The loop stops when `token` is cancelled, either between cycles or while
/// waiting; a cycle in progress is left to observe cancellation itself.
pub fn spawn(
    runner: Arc<dyn CycleRunner>,
    metrics: Arc<LifecycleMetrics>,
    timing: SchedulerTiming,
    token: CancellationToken,
) -> SchedulerHandle {
    let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
    let loop_token = token.clone();

    let task = tokio::spawn(async move {
        info!(
            interval_secs = timing.interval.as_secs(),
            backoff_secs = timing.error_backoff.as_secs(),
            "Lifecycle scheduler started"
        );

        let mut delay = timing.interval;
        loop {
            state_tx.send_replace(SchedulerState::Waiting {
                delay_secs: delay.as_secs(),
            });

            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            state_tx.send_replace(SchedulerState::Running);
            let ctx = ExecutionContext::automatic();

            delay = match runner.run(&ctx).await {
                Ok(report) => {
                    info!(
                        correlation_id = %ctx.correlation_id,
                        tables = report.retention.tables_processed,
                        failed_tables = report.retention.failed_tables().count(),
                        records_deleted = report.retention.total_records_deleted,
                        records_moved = report.records_moved(),
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "Lifecycle cycle completed"
                    );
                    timing.interval
                }
                Err(e) if e.is_cancelled() && loop_token.is_cancelled() => {
                    info!(
                        correlation_id = %ctx.correlation_id,
                        "Lifecycle cycle interrupted by shutdown"
                    );
                    break;
                }
                Err(e) => {
                    metrics.record_error();
                    error!(
                        correlation_id = %ctx.correlation_id,
                        error = %e,
                        backoff_secs = timing.error_backoff.as_secs(),
                        "Lifecycle cycle failed"
                    );
                    timing.error_backoff
                }
            };

            if loop_token.is_cancelled() {
                break;
            }
        }

        state_tx.send_replace(SchedulerState::Stopped);
        info!("Lifecycle scheduler stopped");
    });

    SchedulerHandle {
        state: state_rx,
        token,
        task,
    }
}
