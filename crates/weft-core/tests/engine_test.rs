//! End-to-end engine tests: claim an execution and drive the traversal
//! against a real store.

use std::sync::Arc;

use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use weft_core::engine::{Engine, EngineConfig};
use weft_core::humantask::TaskManager;
use weft_core::nodes::ExecutorRegistry;
use weft_core::notify::Notifier;
use weft_db::models::{Execution, ExecutionStatus, NodeRunStatus, TriggerType, WorkflowStatus};
use weft_db::queries::executions as execution_db;
use weft_db::queries::node_executions as node_db;
use weft_test_utils::TestDb;

fn test_engine(pool: &PgPool) -> Arc<Engine> {
    let notifier = Notifier::noop();
    let tasks = TaskManager::new(pool.clone(), notifier.clone());
    let registry = Arc::new(ExecutorRegistry::with_builtins());
    Arc::new(Engine::new(
        pool.clone(),
        registry,
        tasks,
        notifier,
        EngineConfig::default(),
    ))
}

/// Claim the next pending execution and drive it to rest.
async fn drive_once(pool: &PgPool, engine: &Engine) -> Execution {
    let claimed = execution_db::claim_next_pending(pool, "test-worker")
        .await
        .unwrap()
        .expect("an execution should be claimable");
    let id = claimed.id;
    engine.drive_execution(claimed).await;
    execution_db::get_execution_any(pool, id)
        .await
        .unwrap()
        .unwrap()
}

async fn node_output(pool: &PgPool, execution_id: Uuid, node_id: &str) -> Option<Value> {
    node_db::list_for_execution(pool, execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.node_id == node_id && n.status == NodeRunStatus::Completed)
        .next_back()
        .and_then(|n| n.output)
}

#[tokio::test]
async fn manual_trigger_two_step_log_chain() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "hello", "kind": "action:log",
                 "config": {"message": "Hello ${trigger.name}"}}
            ],
            "edges": [{"source": "start", "target": "hello"}]
        }),
    )
    .await;

    engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"name": "Ada"}),
            None,
        )
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let output = node_output(&pool, done.id, "hello").await.unwrap();
    assert_eq!(output["message"], json!("Hello Ada"));

    // Every node on the path completed; none failed.
    let nodes = node_db::list_for_execution(&pool, done.id).await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert!(nodes.iter().all(|n| n.status == NodeRunStatus::Completed));

    db.close().await;
}

#[tokio::test]
async fn loop_with_break_condition_stops_midway() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "each", "kind": "control:loop", "config": {
                    "source": ["one", "two", "stop", "four"],
                    "item_variable": "item",
                    "max_iterations": 10,
                    "break_condition": "item == 'stop'"
                }},
                {"id": "echo", "kind": "action:formula", "config": {"expression": "item"}},
                {"id": "after", "kind": "action:log", "config": {"message": "done"}}
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "echo", "label": "body"},
                {"source": "each", "target": "after", "label": "done"}
            ]
        }),
    )
    .await;

    engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    // Three iterations ran: "one", "two", "stop"; the break fires after
    // the iteration that saw "stop".
    let loop_output = node_output(&pool, done.id, "each").await.unwrap();
    assert_eq!(loop_output, json!(["one", "two", "stop"]));

    let echo_attempts: Vec<_> = node_db::list_for_execution(&pool, done.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.node_id == "echo")
        .collect();
    assert_eq!(echo_attempts.len(), 3);

    db.close().await;
}

#[tokio::test]
async fn loop_exceeding_iteration_limit_fails() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "each", "kind": "control:loop", "config": {
                    "source": [1, 2, 3, 4, 5],
                    "max_iterations": 3
                }},
                {"id": "echo", "kind": "action:formula", "config": {"expression": "item"}}
            ],
            "edges": [
                {"source": "start", "target": "each"},
                {"source": "each", "target": "echo", "label": "body"}
            ]
        }),
    )
    .await;

    engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Failed);
    let message = done.error_message.unwrap();
    assert!(message.contains("max_iterations"), "got: {message}");

    // The iteration bound is enforced before iterating.
    let echo_rows: Vec<_> = node_db::list_for_execution(&pool, done.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.node_id == "echo")
        .collect();
    assert!(echo_rows.is_empty());

    db.close().await;
}

#[tokio::test]
async fn condition_selects_branch_and_skips_the_other() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "gate", "kind": "control:condition",
                 "config": {"expression": "trigger.amount > 100"}},
                {"id": "big", "kind": "action:log", "config": {"message": "big order"}},
                {"id": "small", "kind": "action:log", "config": {"message": "small order"}},
                {"id": "end", "kind": "action:log", "config": {"message": "end"}}
            ],
            "edges": [
                {"source": "start", "target": "gate"},
                {"source": "gate", "target": "big", "label": "true"},
                {"source": "gate", "target": "small", "label": "false"},
                {"source": "big", "target": "end"},
                {"source": "small", "target": "end"}
            ]
        }),
    )
    .await;

    engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"amount": 250}),
            None,
        )
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let nodes = node_db::list_for_execution(&pool, done.id).await.unwrap();
    let status_of = |id: &str| {
        nodes
            .iter()
            .find(|n| n.node_id == id)
            .map(|n| n.status)
            .unwrap()
    };

    assert_eq!(status_of("big"), NodeRunStatus::Completed);
    assert_eq!(status_of("small"), NodeRunStatus::Skipped);
    // The join target still runs: one completed inbound suffices.
    assert_eq!(status_of("end"), NodeRunStatus::Completed);

    let gate = node_output(&pool, done.id, "gate").await.unwrap();
    assert_eq!(gate, json!({"result": true}));

    db.close().await;
}

#[tokio::test]
async fn fork_join_aggregates_branches() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "fan", "kind": "control:fork", "config": {}},
                {"id": "left", "kind": "action:formula", "config": {"expression": "1 + 1"}},
                {"id": "right", "kind": "action:formula", "config": {"expression": "2 + 2"}},
                {"id": "merge", "kind": "control:join", "config": {}}
            ],
            "edges": [
                {"source": "start", "target": "fan"},
                {"source": "fan", "target": "left"},
                {"source": "fan", "target": "right"},
                {"source": "left", "target": "merge"},
                {"source": "right", "target": "merge"}
            ]
        }),
    )
    .await;

    engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let merged = node_output(&pool, done.id, "merge").await.unwrap();
    assert_eq!(merged["left"], json!(2.0));
    assert_eq!(merged["right"], json!(4.0));

    db.close().await;
}

#[tokio::test]
async fn transform_chains_node_outputs() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "double", "kind": "action:formula",
                 "config": {"expression": "trigger.amount * 2"}},
                {"id": "shape", "kind": "action:transform", "config": {"mappings": {
                    "original": "${trigger.amount}",
                    "doubled": "${double}",
                    "label": "order ${trigger.id}"
                }}}
            ],
            "edges": [
                {"source": "start", "target": "double"},
                {"source": "double", "target": "shape"}
            ]
        }),
    )
    .await;

    engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"amount": 21, "id": "A-7"}),
            None,
        )
        .await
        .unwrap();

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let shaped = node_output(&pool, done.id, "shape").await.unwrap();
    assert_eq!(shaped["original"], json!(21));
    assert_eq!(shaped["doubled"], json!(42.0));
    assert_eq!(shaped["label"], json!("order A-7"));

    // The execution output is the terminal node's output.
    assert_eq!(done.output.unwrap(), shaped);

    db.close().await;
}

#[tokio::test]
async fn start_rejects_non_active_workflows() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow_with_status(
        tenant,
        WorkflowStatus::Draft,
        &json!({
            "nodes": [{"id": "start", "kind": "trigger:manual", "config": {}}],
            "edges": []
        }),
    )
    .await;

    let err = engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .expect_err("draft workflow must not execute");
    assert_eq!(err.code(), "PRECONDITION_FAILED");

    db.close().await;
}

#[tokio::test]
async fn cancel_mid_delay_stops_the_run() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "wait", "kind": "control:delay", "config": {"duration_ms": 8000}},
                {"id": "after", "kind": "action:log", "config": {"message": "never"}}
            ],
            "edges": [
                {"source": "start", "target": "wait"},
                {"source": "wait", "target": "after"}
            ]
        }),
    )
    .await;

    let execution = engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();

    let claimed = execution_db::claim_next_pending(&pool, "test-worker")
        .await
        .unwrap()
        .unwrap();

    let driver = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.drive_execution(claimed).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    engine.cancel(tenant, execution.id, "stop it").await.unwrap();

    driver.await.unwrap();

    let row = execution_db::get_execution_any(&pool, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);

    // The continuation never ran.
    let nodes = node_db::list_for_execution(&pool, execution.id).await.unwrap();
    assert!(nodes.iter().all(|n| n.node_id != "after"));

    db.close().await;
}

#[tokio::test]
async fn long_delay_suspends_and_timer_wake_resumes() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "wait", "kind": "control:delay", "config": {"duration_ms": 120000}},
                {"id": "after", "kind": "action:log", "config": {"message": "woke up"}}
            ],
            "edges": [
                {"source": "start", "target": "wait"},
                {"source": "wait", "target": "after"}
            ]
        }),
    )
    .await;

    engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();

    let suspended = drive_once(&pool, &engine).await;
    assert_eq!(suspended.status, ExecutionStatus::Suspended);
    assert_eq!(suspended.resume_node_id.as_deref(), Some("wait"));
    assert!(suspended.wake_at.is_some());

    // Pretend the timer came due, then let the scanner re-enqueue it.
    sqlx::query("UPDATE executions SET wake_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(suspended.id)
        .execute(&pool)
        .await
        .unwrap();
    let woken = execution_db::wake_due_timers(&pool, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(woken, vec![suspended.id]);

    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(
        node_output(&pool, done.id, "after").await.unwrap()["message"],
        json!("woke up")
    );

    db.close().await;
}
