//! Tests for the executions table as the engine's durable queue, and for
//! node execution bookkeeping.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use weft_db::models::{ExecutionStatus, NodeRunStatus, TriggerType};
use weft_db::queries::executions::{self, NewExecution};
use weft_db::queries::node_executions;
use weft_test_utils::TestDb;

async fn seed_execution(db: &TestDb, tenant: Uuid) -> weft_db::models::Execution {
    let workflow = db
        .seed_workflow(tenant, &json!({"nodes": [], "edges": []}))
        .await;

    executions::insert_execution(
        &db.pool,
        &NewExecution {
            tenant_id: tenant,
            workflow_id: workflow.id,
            workflow_version: 1,
            trigger_type: TriggerType::Manual,
            trigger_payload: &json!({"name": "Ada"}),
            parent_execution_id: None,
            parent_node_id: None,
            depth: 0,
        },
    )
    .await
    .expect("execution insert")
}

#[tokio::test]
async fn claim_transitions_pending_to_running() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;
    assert_eq!(execution.status, ExecutionStatus::Pending);

    let claimed = executions::claim_next_pending(&pool, "worker-0")
        .await
        .unwrap()
        .expect("one pending execution should be claimable");
    assert_eq!(claimed.id, execution.id);
    assert_eq!(claimed.status, ExecutionStatus::Running);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-0"));
    assert!(claimed.started_at.is_some());

    // Nothing left to claim.
    assert!(executions::claim_next_pending(&pool, "worker-1")
        .await
        .unwrap()
        .is_none());

    db.close().await;
}

#[tokio::test]
async fn terminal_transitions_are_status_guarded() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    // Completing a pending (unclaimed) execution is a no-op.
    let rows = executions::mark_completed(&pool, execution.id, &json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(rows, 0);

    executions::claim_next_pending(&pool, "w").await.unwrap();
    let rows = executions::mark_completed(&pool, execution.id, &json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Terminal states are final: cancel now affects nothing.
    let cancelled = executions::mark_cancelled(&pool, tenant, execution.id, "late")
        .await
        .unwrap();
    assert!(cancelled.is_none());

    db.close().await;
}

#[tokio::test]
async fn suspend_resume_cycle() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    executions::claim_next_pending(&pool, "w").await.unwrap();
    let rows = executions::suspend(&pool, execution.id, "approve-step", None)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let suspended = executions::get_execution(&pool, tenant, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(suspended.status, ExecutionStatus::Suspended);
    assert_eq!(suspended.resume_node_id.as_deref(), Some("approve-step"));
    assert!(suspended.claimed_by.is_none());

    let rows = executions::resume_to_pending(
        &pool,
        execution.id,
        "approve-step",
        &json!({"status": "approved"}),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let resumed = executions::get_execution(&pool, tenant, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Pending);
    assert_eq!(resumed.resume_payload, Some(json!({"status": "approved"})));

    db.close().await;
}

#[tokio::test]
async fn due_timers_wake_to_pending() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    executions::claim_next_pending(&pool, "w").await.unwrap();
    executions::suspend(
        &pool,
        execution.id,
        "delay-step",
        Some(Utc::now() - Duration::seconds(5)),
    )
    .await
    .unwrap();

    let woken = executions::wake_due_timers(&pool, Utc::now()).await.unwrap();
    assert_eq!(woken, vec![execution.id]);

    let row = executions::get_execution(&pool, tenant, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Pending);
    assert!(row.wake_at.is_none());
    assert_eq!(
        row.resume_payload.unwrap().get("timer_elapsed"),
        Some(&json!(true))
    );

    // A future timer does not wake.
    let execution2 = seed_execution(&db, tenant).await;
    executions::claim_execution(&pool, execution2.id, "w").await.unwrap();
    executions::suspend(
        &pool,
        execution2.id,
        "delay-step",
        Some(Utc::now() + Duration::hours(1)),
    )
    .await
    .unwrap();
    assert!(executions::wake_due_timers(&pool, Utc::now())
        .await
        .unwrap()
        .is_empty());

    db.close().await;
}

#[tokio::test]
async fn stale_claims_are_reaped() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    executions::claim_next_pending(&pool, "crashed-worker")
        .await
        .unwrap();

    // Fresh claims survive.
    assert!(executions::reap_stale_claims(&pool, 300).await.unwrap().is_empty());

    // Age the claim artificially, then reap.
    sqlx::query("UPDATE executions SET claimed_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(execution.id)
        .execute(&pool)
        .await
        .unwrap();

    let reaped = executions::reap_stale_claims(&pool, 300).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, execution.id);
    assert_eq!(reaped[0].status, ExecutionStatus::Pending);

    db.close().await;
}

#[tokio::test]
async fn node_execution_upsert_and_replay_outputs() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    let row = node_executions::upsert_started(&pool, execution.id, "fetch", 1, &json!({}))
        .await
        .unwrap();
    assert_eq!(row.status, NodeRunStatus::Running);

    node_executions::mark_completed(&pool, row.id, &json!({"status": 200}))
        .await
        .unwrap();

    // Retry writes a second attempt for the same node.
    let retry_row = node_executions::upsert_started(&pool, execution.id, "fetch", 2, &json!({}))
        .await
        .unwrap();
    node_executions::mark_completed(&pool, retry_row.id, &json!({"status": 201}))
        .await
        .unwrap();

    // A crash replay of attempt 2 resets the same row instead of violating
    // uniqueness.
    let replayed = node_executions::upsert_started(&pool, execution.id, "fetch", 2, &json!({}))
        .await
        .unwrap();
    assert_eq!(replayed.id, retry_row.id);
    assert_eq!(replayed.status, NodeRunStatus::Running);
    node_executions::mark_completed(&pool, replayed.id, &json!({"status": 202}))
        .await
        .unwrap();

    let outputs = node_executions::latest_completed_outputs(&pool, execution.id)
        .await
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].0, "fetch");
    // Highest attempt wins.
    assert_eq!(outputs[0].1, json!({"status": 202}));

    let all = node_executions::list_for_execution(&pool, execution.id)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    for row in &all {
        if row.status == NodeRunStatus::Completed {
            assert!(row.duration_ms.is_some());
            assert!(row.completed_at.is_some());
        }
    }

    db.close().await;
}

#[tokio::test]
async fn skipped_nodes_record_idempotently() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let tenant = Uuid::new_v4();
    let execution = seed_execution(&db, tenant).await;

    node_executions::insert_skipped(&pool, execution.id, "untaken")
        .await
        .unwrap();
    node_executions::insert_skipped(&pool, execution.id, "untaken")
        .await
        .unwrap();

    let all = node_executions::list_for_execution(&pool, execution.id)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, NodeRunStatus::Skipped);

    db.close().await;
}
