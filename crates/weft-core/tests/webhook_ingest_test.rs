//! Webhook ingester integration: signature auth, filter evaluation, event
//! recording, and execution hand-off.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use weft_core::engine::{Engine, EngineConfig};
use weft_core::humantask::TaskManager;
use weft_core::nodes::ExecutorRegistry;
use weft_core::notify::Notifier;
use weft_core::webhook::{self, IngestOutcome, SIGNATURE_HEADER};
use weft_db::models::{
    ExecutionStatus, FilterOperator, TriggerType, WebhookAuthType, WebhookEventStatus, Workflow,
};
use weft_db::queries::executions as execution_db;
use weft_db::queries::webhook_events;
use weft_db::queries::webhooks::{self as webhook_db, NewWebhook, NewWebhookFilter};
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

async fn create_webhook_workflow(db: &TestDb, tenant: Uuid) -> Workflow {
    db.seed_workflow(
        tenant,
        &json!({
            "nodes": [
                {"id": "hook", "kind": "trigger:webhook", "config": {}},
                {"id": "log", "kind": "action:log",
                 "config": {"message": "event ${trigger.event}"}}
            ],
            "edges": [{"source": "hook", "target": "log"}]
        }),
    )
    .await
}

async fn create_webhook(
    pool: &PgPool,
    tenant: Uuid,
    workflow_id: Uuid,
    auth_type: WebhookAuthType,
    secret: Option<&str>,
) -> weft_db::models::Webhook {
    webhook_db::insert_webhook(
        pool,
        &NewWebhook {
            tenant_id: tenant,
            workflow_id,
            node_id: "hook",
            path: "orders/incoming",
            auth_type,
            secret,
            api_key_header: "X-API-Key",
            enabled: true,
        },
    )
    .await
    .unwrap()
}

fn headers(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn valid_signature_is_accepted_and_starts_an_execution() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(
        &pool,
        tenant,
        workflow.id,
        WebhookAuthType::Signature,
        Some("s3cr3t"),
    )
    .await;

    let body = br#"{"event":"x"}"#;
    let signature = webhook::sign("s3cr3t", body);

    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[(SIGNATURE_HEADER, signature)]),
        body,
    )
    .await
    .unwrap();

    let IngestOutcome::Accepted { execution_id } = outcome else {
        panic!("expected acceptance");
    };

    let execution = execution_db::get_execution(&pool, tenant, execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.trigger_type, TriggerType::Webhook);
    assert_eq!(execution.trigger_payload, json!({"event": "x"}));
    assert_eq!(execution.status, ExecutionStatus::Pending);

    let events = webhook_events::list_for_webhook(&pool, tenant, hook.id, 10)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, WebhookEventStatus::Accepted);
    assert_eq!(events[0].execution_id, Some(execution_id));
    // The signature header is never recorded.
    let recorded = events[0].headers.clone().unwrap();
    assert!(recorded.get(SIGNATURE_HEADER).is_none());

    db.close().await;
}

#[tokio::test]
async fn bad_signature_is_unauthorized_without_execution() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(
        &pool,
        tenant,
        workflow.id,
        WebhookAuthType::Signature,
        Some("s3cr3t"),
    )
    .await;

    let body = br#"{"event":"x"}"#;
    let err = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[(SIGNATURE_HEADER, "sha256=deadbeef".to_owned())]),
        body,
    )
    .await
    .expect_err("bad signature must be rejected");
    assert_eq!(err.code(), "UNAUTHORIZED");

    // No execution, no accepted event.
    let executions =
        execution_db::list_executions(&pool, tenant, Some(workflow.id), None, 10)
            .await
            .unwrap();
    assert!(executions.is_empty());

    // Missing header is rejected the same way.
    let err = webhook::ingest(&pool, &engine, workflow.id, hook.id, &headers(&[]), body)
        .await
        .expect_err("missing signature header");
    assert_eq!(err.code(), "UNAUTHORIZED");

    db.close().await;
}

#[tokio::test]
async fn api_key_auth_compares_the_configured_header() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(
        &pool,
        tenant,
        workflow.id,
        WebhookAuthType::ApiKey,
        Some("key-123"),
    )
    .await;

    let body = br#"{"event":"x"}"#;

    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[("x-api-key", "key-123".to_owned())]),
        body,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    let err = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[("x-api-key", "wrong".to_owned())]),
        body,
    )
    .await
    .expect_err("wrong api key");
    assert_eq!(err.code(), "UNAUTHORIZED");

    db.close().await;
}

#[tokio::test]
async fn disabled_or_mismatched_webhooks_are_not_found() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(&pool, tenant, workflow.id, WebhookAuthType::None, None).await;

    let body = br#"{"event":"x"}"#;

    // Wrong workflow id in the path.
    let err = webhook::ingest(&pool, &engine, Uuid::new_v4(), hook.id, &headers(&[]), body)
        .await
        .expect_err("mismatched workflow");
    assert_eq!(err.code(), "NOT_FOUND");

    // Disabled webhook.
    webhook_db::update_webhook(
        &pool,
        tenant,
        hook.id,
        &hook.path,
        hook.auth_type,
        None,
        &hook.api_key_header,
        false,
    )
    .await
    .unwrap();
    let err = webhook::ingest(&pool, &engine, workflow.id, hook.id, &headers(&[]), body)
        .await
        .expect_err("disabled webhook");
    assert_eq!(err.code(), "NOT_FOUND");

    db.close().await;
}

#[tokio::test]
async fn malformed_body_is_a_validation_error() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(&pool, tenant, workflow.id, WebhookAuthType::None, None).await;

    let err = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[]),
        b"not json at all",
    )
    .await
    .expect_err("malformed body");
    assert_eq!(err.code(), "VALIDATION_ERROR");

    db.close().await;
}

#[tokio::test]
async fn filtered_payload_records_event_without_execution() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(&pool, tenant, workflow.id, WebhookAuthType::None, None).await;

    // Group 0: event == "order.created" AND amount >= ... (two conjuncts).
    // Group 1: event == "refund".
    for (path, op, value, group) in [
        ("$.event", FilterOperator::Equals, Some("\"order.created\""), 0),
        ("$.amount", FilterOperator::Exists, None, 0),
        ("$.event", FilterOperator::Equals, Some("\"refund\""), 1),
    ] {
        webhook_db::insert_filter(
            &pool,
            &NewWebhookFilter {
                webhook_id: hook.id,
                field_path: path,
                operator: op,
                value,
                logic_group: group,
                enabled: true,
                position: 0,
            },
        )
        .await
        .unwrap();
    }

    // Passes via group 0.
    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[]),
        br#"{"event":"order.created","amount":10}"#,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    // Passes via group 1.
    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[]),
        br#"{"event":"refund"}"#,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    // Matches no group: recorded as filtered, no execution started.
    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[]),
        br#"{"event":"order.created"}"#,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, IngestOutcome::Filtered));

    let events = webhook_events::list_for_webhook(&pool, tenant, hook.id, 10)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    let filtered: Vec<_> = events
        .iter()
        .filter(|e| e.status == WebhookEventStatus::Filtered)
        .collect();
    assert_eq!(filtered.len(), 1);
    assert!(filtered[0].execution_id.is_none());

    let executions =
        execution_db::list_executions(&pool, tenant, Some(workflow.id), None, 10)
            .await
            .unwrap();
    assert_eq!(executions.len(), 2);

    db.close().await;
}

#[tokio::test]
async fn accepted_webhook_execution_runs_with_the_payload() {
    let db = TestDb::new().await;
    let pool = db.pool.clone();
    let engine = test_engine(&pool);
    let tenant = Uuid::new_v4();
    let workflow = create_webhook_workflow(&db, tenant).await;
    let hook = create_webhook(&pool, tenant, workflow.id, WebhookAuthType::None, None).await;

    let outcome = webhook::ingest(
        &pool,
        &engine,
        workflow.id,
        hook.id,
        &headers(&[]),
        br#"{"event":"deploy"}"#,
    )
    .await
    .unwrap();
    let IngestOutcome::Accepted { execution_id } = outcome else {
        panic!("expected acceptance");
    };

    let claimed = execution_db::claim_next_pending(&pool, "test-worker")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, execution_id);
    engine.drive_execution(claimed).await;

    let done = execution_db::get_execution_any(&pool, execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.output.unwrap()["message"], json!("event deploy"));

    db.close().await;
}
