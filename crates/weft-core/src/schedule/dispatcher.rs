//! The schedule dispatcher: periodic due-scan under a shared lease, overlap
//! policy enforcement, and execution hand-off.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use weft_db::models::{OverlapPolicy, Schedule, TriggerType};
use weft_db::queries::{executions as execution_db, leases, schedules as schedule_db};

use crate::engine::Engine;
use crate::error::EngineError;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the due-scan runs.
    pub poll_interval: Duration,
    /// Lease TTL; must comfortably exceed one scan.
    pub lease_ttl_secs: i64,
    /// Max schedules dispatched per tick.
    pub batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            lease_ttl_secs: 15,
            batch_size: 50,
        }
    }
}

/// Run the dispatcher loop until cancelled.
pub async fn run_schedule_dispatcher(
    pool: PgPool,
    engine: Arc<Engine>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) {
    let owner = format!("dispatcher-{}", uuid::Uuid::new_v4().simple());
    tracing::info!(owner = %owner, "schedule dispatcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        match leases::acquire(&pool, "schedule-dispatcher", &owner, config.lease_ttl_secs).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "dispatcher lease acquisition failed");
                continue;
            }
        }

        match dispatch_due(&pool, &engine, Utc::now(), config.batch_size).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(dispatched = n, "schedule dispatcher tick"),
            Err(e) => tracing::warn!(error = %e, "schedule dispatch tick failed"),
        }
    }

    let _ = leases::release(&pool, "schedule-dispatcher", &owner).await;
    tracing::info!("schedule dispatcher stopped");
}

/// One dispatcher tick: fire every enabled schedule whose `next_run_at` has
/// passed. Returns the number of executions started.
pub async fn dispatch_due(
    pool: &PgPool,
    engine: &Engine,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<usize, EngineError> {
    let due = schedule_db::due_schedules(pool, now, batch_size)
        .await
        .map_err(EngineError::internal)?;

    let mut dispatched = 0;
    for schedule in due {
        match fire_schedule(pool, engine, &schedule, now).await {
            Ok(true) => dispatched += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "schedule firing failed"
                );
            }
        }
    }
    Ok(dispatched)
}

/// Fire one due schedule, honoring its overlap policy. Returns whether an
/// execution was dispatched.
async fn fire_schedule(
    pool: &PgPool,
    engine: &Engine,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let next_run_at = compute_next_run(schedule, now)?;

    match schedule.overlap_policy {
        OverlapPolicy::Skip => {
            let running = execution_db::non_terminal_for_schedule(pool, schedule.id)
                .await
                .map_err(EngineError::internal)?;
            if !running.is_empty() {
                tracing::info!(
                    schedule_id = %schedule.id,
                    running = running.len(),
                    "skipping tick, prior run still active"
                );
                schedule_db::set_next_run(pool, schedule.id, next_run_at)
                    .await
                    .map_err(EngineError::internal)?;
                return Ok(false);
            }
        }
        OverlapPolicy::Terminate => {
            // Only executions this schedule dispatched are terminated;
            // manual and webhook runs of the workflow are left alone.
            let running = execution_db::non_terminal_for_schedule(pool, schedule.id)
                .await
                .map_err(EngineError::internal)?;
            for execution in running {
                match engine
                    .cancel(
                        execution.tenant_id,
                        execution.id,
                        "terminated by schedule overlap policy",
                    )
                    .await
                {
                    Ok(_) => {
                        tracing::info!(
                            schedule_id = %schedule.id,
                            execution_id = %execution.id,
                            "terminated overlapping execution"
                        );
                    }
                    Err(EngineError::PreconditionFailed(_)) => {}
                    Err(e) => {
                        tracing::warn!(
                            execution_id = %execution.id,
                            error = %e,
                            "failed to terminate overlapping execution"
                        );
                    }
                }
            }
        }
        OverlapPolicy::Queue => {}
    }

    let started = engine
        .start(
            schedule.tenant_id,
            schedule.workflow_id,
            None,
            TriggerType::Schedule,
            json!({ "schedule_id": schedule.id }),
            None,
        )
        .await;

    match started {
        Ok(execution) => {
            schedule_db::record_dispatch(pool, schedule.id, now, execution.id, next_run_at)
                .await
                .map_err(EngineError::internal)?;
            tracing::info!(
                schedule_id = %schedule.id,
                execution_id = %execution.id,
                next_run_at = ?next_run_at,
                "schedule fired"
            );
            Ok(true)
        }
        Err(e) => {
            // A misconfigured or inactive workflow must not wedge the
            // dispatcher on this schedule; advance the clock and report.
            schedule_db::set_next_run(pool, schedule.id, next_run_at)
                .await
                .map_err(EngineError::internal)?;
            tracing::warn!(
                schedule_id = %schedule.id,
                error = %e,
                "schedule dispatch rejected, advancing next run"
            );
            Ok(false)
        }
    }
}

/// Compute the firing after `now` in the schedule's zone.
pub fn compute_next_run(
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let spec = super::parse_cron(&schedule.cron_expression)?;
    let tz = super::parse_timezone(&schedule.timezone)?;
    Ok(spec.next_after(tz, now))
}
