//! Human-task integration: suspension, approval resume, rejection data
//! flow, and the multi-level escalation scanner.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use weft_core::engine::{Engine, EngineConfig};
use weft_core::humantask::{TaskAction, TaskManager};
use weft_core::nodes::ExecutorRegistry;
use weft_core::notify::Notifier;
use weft_db::models::{EscalationStatus, Execution, ExecutionStatus, TaskStatus, TriggerType};
use weft_db::queries::executions as execution_db;
use weft_db::queries::human_tasks as task_db;
use weft_db::queries::node_executions as node_db;
use weft_db::queries::task_escalations;
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

fn approval_workflow() -> Value {
    json!({
        "nodes": [
            {"id": "start", "kind": "trigger:manual", "config": {}},
            {"id": "approve", "kind": "human:task", "config": {
                "task_type": "approval",
                "title": "Approve order ${trigger.order_id}",
                "assignees": ["alice"],
                "timeout_minutes": 30
            }},
            {"id": "after", "kind": "action:log",
             "config": {"message": "approved by ${approve.completed_by}"}}
        ],
        "edges": [
            {"source": "start", "target": "approve"},
            {"source": "approve", "target": "after"}
        ]
    })
}

#[tokio::test]
async fn approval_suspends_then_resumes_with_response() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(tenant, &approval_workflow()).await;
    engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"order_id": "A-1"}),
            None,
        )
        .await
        .unwrap();

    // First pass: the run suspends at the human task.
    let suspended = drive_once(&pool, &engine).await;
    assert_eq!(suspended.status, ExecutionStatus::Suspended);
    assert_eq!(suspended.resume_node_id.as_deref(), Some("approve"));

    let task = task_db::get_by_step(&pool, suspended.id, "approve")
        .await
        .unwrap()
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.title, "Approve order A-1");
    assert_eq!(task.assignee_list(), vec!["alice".to_string()]);
    assert!(task.due_date.is_some());

    // Approving re-enqueues the execution.
    engine
        .tasks()
        .complete(
            tenant,
            task.id,
            TaskAction::Approve,
            "alice",
            &[],
            Some(json!({"comment": "ship it"})),
        )
        .await
        .unwrap();

    // Second pass replays to the task node and continues past it.
    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    let after = node_db::list_for_execution(&pool, done.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_id == "after")
        .unwrap();
    assert_eq!(
        after.output.unwrap()["message"],
        json!("approved by alice")
    );

    db.close().await;
}

#[tokio::test]
async fn non_assignee_cannot_complete() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(tenant, &approval_workflow()).await;
    engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"order_id": "A-2"}),
            None,
        )
        .await
        .unwrap();
    let suspended = drive_once(&pool, &engine).await;
    let task = task_db::get_by_step(&pool, suspended.id, "approve")
        .await
        .unwrap()
        .unwrap();

    let err = engine
        .tasks()
        .complete(tenant, task.id, TaskAction::Approve, "mallory", &[], None)
        .await
        .expect_err("non-assignee must be rejected");
    assert_eq!(err.code(), "FORBIDDEN");

    // Role-based assignment works: a caller holding the role completes.
    let err = engine
        .tasks()
        .complete(
            tenant,
            task.id,
            TaskAction::Approve,
            "bob",
            &["ops".to_owned()],
            None,
        )
        .await
        .expect_err("role not on the task either");
    assert_eq!(err.code(), "FORBIDDEN");

    let completed = engine
        .tasks()
        .complete(tenant, task.id, TaskAction::Reject, "alice", &[], None)
        .await
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Rejected);

    // Terminal tasks refuse further transitions.
    let err = engine
        .tasks()
        .complete(tenant, task.id, TaskAction::Approve, "alice", &[], None)
        .await
        .expect_err("terminal task must not transition");
    assert_eq!(err.code(), "PRECONDITION_FAILED");

    db.close().await;
}

#[tokio::test]
async fn escalation_chain_then_final_action() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "approve", "kind": "human:task", "config": {
                    "title": "Sign-off",
                    "assignees": ["analyst"],
                    "timeout_minutes": 30,
                    "escalation": {
                        "enabled": true,
                        "levels": [
                            {"level": 1, "timeout_minutes": 30, "backup_approvers": ["mgr"]}
                        ],
                        "final_action": "auto_approve"
                    }
                }},
                {"id": "after", "kind": "action:log", "config": {"message": "released"}}
            ],
            "edges": [
                {"source": "start", "target": "approve"},
                {"source": "approve", "target": "after"}
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

    let task = task_db::get_by_step(&pool, suspended.id, "approve")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.max_escalation_level, 1);

    // Make the task overdue and run the scanner: level 1 escalation.
    sqlx::query("UPDATE human_tasks SET due_date = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let processed = engine.tasks().process_overdue(None, 10).await.unwrap();
    assert_eq!(processed, 1);

    let escalated = task_db::get_task(&pool, tenant, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(escalated.status, TaskStatus::Pending);
    assert_eq!(escalated.escalation_level, 1);
    assert_eq!(escalated.assignee_list(), vec!["mgr".to_string()]);
    assert!(escalated.last_escalated_at.is_some());
    let due = escalated.due_date.unwrap();
    let expected = Utc::now() + chrono::Duration::minutes(30);
    assert!((due - expected).num_seconds().abs() < 60, "due ~ now+30min");

    let history = task_escalations::list_for_task(&pool, task.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, EscalationStatus::Active);
    assert_eq!(history[0].escalated_to, json!(["mgr"]));

    // Overdue again at the highest level: the final action applies.
    sqlx::query("UPDATE human_tasks SET due_date = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();
    let processed = engine.tasks().process_overdue(None, 10).await.unwrap();
    assert_eq!(processed, 1);

    let finalized = task_db::get_task(&pool, tenant, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finalized.status, TaskStatus::Approved);
    assert_eq!(finalized.completed_by.as_deref(), Some("system"));

    let history = task_escalations::list_for_task(&pool, task.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let completed: Vec<_> = history
        .iter()
        .filter(|e| e.status == EscalationStatus::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].auto_action_taken.as_deref(), Some("auto_approve"));
    assert!(history.iter().all(|e| e.status != EscalationStatus::Active));

    // The execution resumed and runs to completion.
    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);

    db.close().await;
}

#[tokio::test]
async fn legacy_on_timeout_auto_reject() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "start", "kind": "trigger:manual", "config": {}},
                {"id": "approve", "kind": "human:task", "config": {
                    "title": "Legacy gate",
                    "assignees": ["analyst"],
                    "timeout_minutes": 15,
                    "on_timeout": "auto_reject"
                }},
                {"id": "after", "kind": "action:log",
                 "config": {"message": "outcome ${approve.status}"}}
            ],
            "edges": [
                {"source": "start", "target": "approve"},
                {"source": "approve", "target": "after"}
            ]
        }),
    )
    .await;

    engine
        .start(tenant, workflow.id, None, TriggerType::Manual, json!({}), None)
        .await
        .unwrap();
    let suspended = drive_once(&pool, &engine).await;

    let task = task_db::get_by_step(&pool, suspended.id, "approve")
        .await
        .unwrap()
        .unwrap();
    sqlx::query("UPDATE human_tasks SET due_date = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    engine.tasks().process_overdue(None, 10).await.unwrap();

    let rejected = task_db::get_task(&pool, tenant, task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rejected.status, TaskStatus::Rejected);

    // The run continues; downstream observes the rejection.
    let done = drive_once(&pool, &engine).await;
    assert_eq!(done.status, ExecutionStatus::Completed);
    let after = node_db::list_for_execution(&pool, done.id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_id == "after")
        .unwrap();
    assert_eq!(after.output.unwrap()["message"], json!("outcome rejected"));

    db.close().await;
}

#[tokio::test]
async fn execution_cancel_cancels_pending_tasks() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();

    let workflow = db.seed_workflow(tenant, &approval_workflow()).await;
    let execution = engine
        .start(
            tenant,
            workflow.id,
            None,
            TriggerType::Manual,
            json!({"order_id": "A-3"}),
            None,
        )
        .await
        .unwrap();
    drive_once(&pool, &engine).await;

    engine
        .cancel(tenant, execution.id, "operator cancelled")
        .await
        .unwrap();

    let task = task_db::get_by_step(&pool, execution.id, "approve")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    let row = execution_db::get_execution_any(&pool, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Cancelled);

    db.close().await;
}
