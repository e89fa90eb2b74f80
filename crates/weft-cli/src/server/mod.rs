//! The HTTP surface: control plane (`/api/v1/...`) and data plane
//! (`/webhooks/...`).
//!
//! Tenancy comes from the `X-Tenant-ID` header and the caller identity from
//! `X-User-ID` / `X-User-Roles`; a real authentication middleware in front
//! of this service is expected to populate them. Errors render as
//! `{error, code}` with the engine's stable code constants.

pub mod executions;
pub mod ingest;
pub mod notifications;
pub mod schedules;
pub mod tasks;
pub mod webhooks;
pub mod workflows;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use weft_core::engine::Engine;
use weft_core::error::EngineError;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<Engine>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "CONFLICT",
            message: message.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: "internal error".to_owned(),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) | EngineError::Expression(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::PreconditionFailed(_)
            | EngineError::DepthLimitExceeded(_)
            | EngineError::CyclicSubWorkflow(_)
            | EngineError::IterationLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, code = err.code(), "engine error surfaced as 500");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message, "code": self.code });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Identity extraction
// ---------------------------------------------------------------------------

/// The authenticated caller, as asserted by the fronting auth middleware.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// Read the tenant from `X-Tenant-ID`.
pub fn tenant_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing X-Tenant-ID header"))?;
    raw.parse()
        .map_err(|_| AppError::bad_request("X-Tenant-ID must be a UUID"))
}

/// Read the caller identity from `X-User-ID` / `X-User-Roles`.
pub fn identity(headers: &HeaderMap) -> Result<Identity, AppError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: "missing X-User-ID header".to_owned(),
        })?;
    let roles = headers
        .get("x-user-roles")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    Ok(Identity { user_id, roles })
}

/// Caller name for audit entries; absent identity records as `anonymous`.
pub fn actor(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_owned()
}

/// Best-effort audit write.
pub async fn audit(
    state: &AppState,
    tenant: Uuid,
    actor: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
) {
    if let Err(e) = weft_db::queries::audit_logs::insert_audit(
        &state.pool,
        tenant,
        actor,
        action,
        entity_type,
        entity_id,
        None,
    )
    .await
    {
        tracing::warn!(action = %action, error = %e, "audit write failed (best-effort)");
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(pool: PgPool, engine: Arc<Engine>) -> Router {
    let state = AppState { pool, engine };

    Router::new()
        // Workflows
        .route(
            "/api/v1/workflows",
            post(workflows::create).get(workflows::list),
        )
        .route(
            "/api/v1/workflows/{id}",
            get(workflows::get_one)
                .put(workflows::update)
                .delete(workflows::remove),
        )
        .route("/api/v1/workflows/{id}/validate", post(workflows::validate))
        .route("/api/v1/workflows/{id}/execute", post(workflows::execute))
        .route("/api/v1/workflows/{id}/versions", get(workflows::versions))
        .route(
            "/api/v1/workflows/{id}/restore/{version}",
            post(workflows::restore),
        )
        // Executions
        .route("/api/v1/executions", get(executions::list))
        .route("/api/v1/executions/{id}", get(executions::get_one))
        .route("/api/v1/executions/{id}/cancel", post(executions::cancel))
        // Schedules
        .route(
            "/api/v1/workflows/{id}/schedules",
            post(schedules::create).get(schedules::list_for_workflow),
        )
        .route("/api/v1/schedules/parse-cron", post(schedules::parse))
        .route(
            "/api/v1/schedules/{id}",
            get(schedules::get_one)
                .put(schedules::update)
                .delete(schedules::remove),
        )
        // Webhooks
        .route(
            "/api/v1/workflows/{id}/webhooks",
            post(webhooks::create).get(webhooks::list_for_workflow),
        )
        .route(
            "/api/v1/webhooks/{id}",
            get(webhooks::get_one)
                .put(webhooks::update)
                .delete(webhooks::remove),
        )
        .route(
            "/api/v1/webhooks/{id}/filters",
            post(webhooks::add_filter).get(webhooks::list_filters),
        )
        .route(
            "/api/v1/webhooks/{id}/filters/test",
            post(webhooks::test_filters),
        )
        .route("/api/v1/webhook-filters/{id}", axum::routing::delete(webhooks::remove_filter))
        .route("/api/v1/webhooks/{id}/events", get(webhooks::events))
        // Human tasks
        .route("/api/v1/tasks", get(tasks::list))
        .route("/api/v1/tasks/{id}", get(tasks::get_one))
        .route("/api/v1/tasks/{id}/approve", post(tasks::approve))
        .route("/api/v1/tasks/{id}/reject", post(tasks::reject))
        .route("/api/v1/tasks/{id}/submit", post(tasks::submit))
        .route("/api/v1/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/v1/tasks/{id}/escalate", post(tasks::escalate))
        .route("/api/v1/tasks/{id}/escalations", get(tasks::escalations))
        // Notifications
        .route("/api/v1/notifications", get(notifications::list))
        .route(
            "/api/v1/notifications/{id}/read",
            post(notifications::mark_read),
        )
        // Data plane
        .route("/webhooks/{workflow_id}/{webhook_id}", post(ingest::receive))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until Ctrl+C.
pub async fn run_server(
    pool: PgPool,
    engine: Arc<Engine>,
    bind: &str,
    port: u16,
) -> Result<()> {
    let app = build_router(pool, engine);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("weft listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("weft server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{Value, json};
    use sqlx::PgPool;
    use tower::ServiceExt;
    use uuid::Uuid;

    use weft_core::engine::{Engine, EngineConfig};
    use weft_core::humantask::TaskManager;
    use weft_core::nodes::ExecutorRegistry;
    use weft_core::notify::Notifier;
    use weft_core::webhook::sign;
    use weft_db::models::ExecutionStatus;
    use weft_db::queries::executions as execution_db;
    use weft_test_utils::TestDb;

    // -----------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------

    struct TestApp {
        pool: PgPool,
        engine: Arc<Engine>,
        router: Router,
        tenant: Uuid,
        db: TestDb,
    }

    async fn test_app() -> TestApp {
        let db = TestDb::new().await;
        let pool = db.pool.clone();
        let notifier = Notifier::noop();
        let tasks = TaskManager::new(pool.clone(), notifier.clone());
        let registry = Arc::new(ExecutorRegistry::with_builtins());
        let engine = Arc::new(Engine::new(
            pool.clone(),
            registry,
            tasks,
            notifier,
            EngineConfig::default(),
        ));
        let router = super::build_router(pool.clone(), Arc::clone(&engine));
        TestApp {
            pool,
            engine,
            router,
            tenant: Uuid::new_v4(),
            db,
        }
    }

    impl TestApp {
        async fn request(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> axum::response::Response {
            let mut builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("x-tenant-id", self.tenant.to_string())
                .header("x-user-id", "tester");
            let body = match body {
                Some(json) => {
                    builder = builder.header("content-type", "application/json");
                    Body::from(serde_json::to_vec(&json).unwrap())
                }
                None => Body::empty(),
            };
            self.router
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap()
        }

        async fn post(&self, uri: &str, body: Value) -> axum::response::Response {
            self.request(Method::POST, uri, Some(body)).await
        }

        async fn get(&self, uri: &str) -> axum::response::Response {
            self.request(Method::GET, uri, None).await
        }

        /// Claim the next pending execution and drive it (stand-in for a
        /// worker process).
        async fn drive_once(&self) -> weft_db::models::Execution {
            let claimed = execution_db::claim_next_pending(&self.pool, "test-worker")
                .await
                .unwrap()
                .expect("an execution should be claimable");
            let id = claimed.id;
            self.engine.drive_execution(claimed).await;
            execution_db::get_execution_any(&self.pool, id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn teardown(self) {
            self.db.close().await;
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn log_workflow_body(name: &str) -> Value {
        json!({
            "name": name,
            "status": "active",
            "definition": {
                "nodes": [
                    {"id": "start", "kind": "trigger:manual", "config": {}},
                    {"id": "hello", "kind": "action:log",
                     "config": {"message": "Hello ${trigger.name}"}}
                ],
                "edges": [{"source": "start", "target": "hello"}]
            }
        })
    }

    // -----------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn create_workflow_returns_201() {
        let app = test_app().await;

        let resp = app.post("/api/v1/workflows", log_workflow_body("greeter")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["name"], "greeter");
        assert_eq!(body["version"], 1);

        app.teardown().await;
    }

    #[tokio::test]
    async fn missing_tenant_header_is_400() {
        let app = test_app().await;

        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/v1/workflows")
            .body(Body::empty())
            .unwrap();
        let resp = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "VALIDATION_ERROR");

        app.teardown().await;
    }

    #[tokio::test]
    async fn duplicate_workflow_name_is_409() {
        let app = test_app().await;

        app.post("/api/v1/workflows", log_workflow_body("dupe")).await;
        let resp = app.post("/api/v1/workflows", log_workflow_body("dupe")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "CONFLICT");

        app.teardown().await;
    }

    #[tokio::test]
    async fn invalid_definition_is_400() {
        let app = test_app().await;

        let resp = app
            .post(
                "/api/v1/workflows",
                json!({
                    "name": "broken",
                    "definition": {
                        "nodes": [{"id": "only", "kind": "action:log", "config": {}}],
                        "edges": []
                    }
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        app.teardown().await;
    }

    #[tokio::test]
    async fn get_missing_workflow_is_404() {
        let app = test_app().await;

        let resp = app.get(&format!("/api/v1/workflows/{}", Uuid::new_v4())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "NOT_FOUND");

        app.teardown().await;
    }

    #[tokio::test]
    async fn validate_reports_warnings() {
        let app = test_app().await;

        let resp = app
            .post(
                "/api/v1/workflows",
                json!({
                    "name": "islandy",
                    "definition": {
                        "nodes": [
                            {"id": "start", "kind": "trigger:manual", "config": {}},
                            {"id": "island", "kind": "action:log", "config": {}}
                        ],
                        "edges": []
                    }
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(&format!("/api/v1/workflows/{id}/validate"), json!({}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["valid"], true);
        assert!(!body["warnings"].as_array().unwrap().is_empty());

        app.teardown().await;
    }

    #[tokio::test]
    async fn update_bumps_version_and_restore_round_trips() {
        let app = test_app().await;

        let created = body_json(
            app.post("/api/v1/workflows", log_workflow_body("versioned")).await,
        )
        .await;
        let id = created["id"].as_str().unwrap().to_owned();
        let v1_definition = created["definition"].clone();

        let mut v2 = log_workflow_body("ignored")["definition"].clone();
        v2["nodes"][1]["config"]["message"] = json!("changed");
        let resp = app
            .request(
                Method::PUT,
                &format!("/api/v1/workflows/{id}"),
                Some(json!({"definition": v2})),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["version"], 2);

        let resp = app
            .post(&format!("/api/v1/workflows/{id}/restore/1"), json!({}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let restored = body_json(resp).await;
        assert_eq!(restored["version"], 3);
        assert_eq!(restored["definition"], v1_definition);

        app.teardown().await;
    }

    // -----------------------------------------------------------------
    // Execute + executions
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn execute_returns_202_and_the_run_completes() {
        let app = test_app().await;

        let created =
            body_json(app.post("/api/v1/workflows", log_workflow_body("runner")).await).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(
                &format!("/api/v1/workflows/{id}/execute"),
                json!({"input": {"name": "Ada"}}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        let execution_id = body["execution_id"].as_str().unwrap().to_owned();
        assert_eq!(body["status"], "pending");

        let done = app.drive_once().await;
        assert_eq!(done.id.to_string(), execution_id);
        assert_eq!(done.status, ExecutionStatus::Completed);

        // The status endpoint exposes the node evaluations.
        let resp = app.get(&format!("/api/v1/executions/{execution_id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let snapshot = body_json(resp).await;
        assert_eq!(snapshot["execution"]["status"], "completed");
        let nodes = snapshot["nodes"].as_array().unwrap();
        let hello = nodes.iter().find(|n| n["node_id"] == "hello").unwrap();
        assert_eq!(hello["output"]["message"], "Hello Ada");

        app.teardown().await;
    }

    #[tokio::test]
    async fn execute_on_draft_workflow_is_422() {
        let app = test_app().await;

        let mut body = log_workflow_body("drafty");
        body["status"] = json!("draft");
        let created = body_json(app.post("/api/v1/workflows", body).await).await;
        let id = created["id"].as_str().unwrap();

        let resp = app
            .post(&format!("/api/v1/workflows/{id}/execute"), json!({}))
            .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "PRECONDITION_FAILED");

        app.teardown().await;
    }

    #[tokio::test]
    async fn cancel_endpoint_cancels_pending_runs() {
        let app = test_app().await;

        let created =
            body_json(app.post("/api/v1/workflows", log_workflow_body("cancellable")).await).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(&format!("/api/v1/workflows/{id}/execute"), json!({}))
            .await;
        let execution_id = body_json(resp).await["execution_id"]
            .as_str()
            .unwrap()
            .to_owned();

        let resp = app
            .post(
                &format!("/api/v1/executions/{execution_id}/cancel"),
                json!({"reason": "changed my mind"}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "cancelled");

        // Cancelling again is a semantic rejection.
        let resp = app
            .post(&format!("/api/v1/executions/{execution_id}/cancel"), json!({}))
            .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        app.teardown().await;
    }

    // -----------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn schedule_crud_and_parse_cron() {
        let app = test_app().await;

        let created =
            body_json(app.post("/api/v1/workflows", log_workflow_body("scheduled")).await).await;
        let id = created["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(
                &format!("/api/v1/workflows/{id}/schedules"),
                json!({
                    "cron_expression": "0   2 * * *",
                    "timezone": "America/New_York",
                    "overlap_policy": "queue"
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let schedule = body_json(resp).await;
        assert_eq!(schedule["cron_expression"], "0 2 * * *");
        assert!(schedule["next_run_at"].is_string());
        let schedule_id = schedule["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(
                "/api/v1/schedules/parse-cron",
                json!({"expression": "*/15 9-17 * * 1-5"}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["normalized"], "*/15 9-17 * * 1-5");
        assert_eq!(parsed["next_runs"].as_array().unwrap().len(), 5);

        let resp = app
            .post("/api/v1/schedules/parse-cron", json!({"expression": "0 2 * *"}))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .request(
                Method::DELETE,
                &format!("/api/v1/schedules/{schedule_id}"),
                None,
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        app.teardown().await;
    }

    // -----------------------------------------------------------------
    // Webhooks + data plane
    // -----------------------------------------------------------------

    async fn webhook_workflow(app: &TestApp) -> (String, String) {
        let resp = app
            .post(
                "/api/v1/workflows",
                json!({
                    "name": format!("hooked-{}", Uuid::new_v4().simple()),
                    "status": "active",
                    "definition": {
                        "nodes": [
                            {"id": "hook", "kind": "trigger:webhook", "config": {}},
                            {"id": "log", "kind": "action:log",
                             "config": {"message": "event ${trigger.event}"}}
                        ],
                        "edges": [{"source": "hook", "target": "log"}]
                    }
                }),
            )
            .await;
        let workflow_id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        let resp = app
            .post(
                &format!("/api/v1/workflows/{workflow_id}/webhooks"),
                json!({
                    "node_id": "hook",
                    "auth_type": "signature",
                    "secret": "s3cr3t"
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let webhook_id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        (workflow_id, webhook_id)
    }

    #[tokio::test]
    async fn webhook_without_secret_is_400() {
        let app = test_app().await;

        let created =
            body_json(app.post("/api/v1/workflows", log_workflow_body("hook-cfg")).await).await;
        let id = created["id"].as_str().unwrap();

        let resp = app
            .post(
                &format!("/api/v1/workflows/{id}/webhooks"),
                json!({"node_id": "start", "auth_type": "signature"}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        app.teardown().await;
    }

    #[tokio::test]
    async fn signed_ingest_starts_an_execution_and_bad_signature_is_401() {
        let app = test_app().await;
        let (workflow_id, webhook_id) = webhook_workflow(&app).await;

        let body = br#"{"event":"x"}"#;
        let signature = sign("s3cr3t", body);

        // Valid signature: 202 with an execution id.
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/webhooks/{workflow_id}/{webhook_id}"))
            .header("content-type", "application/json")
            .header("x-webhook-signature", &signature)
            .body(Body::from(body.to_vec()))
            .unwrap();
        let resp = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let accepted = body_json(resp).await;
        assert!(accepted["execution_id"].is_string());

        // Tampered signature: 401 and no new execution.
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/webhooks/{workflow_id}/{webhook_id}"))
            .header("content-type", "application/json")
            .header("x-webhook-signature", "sha256=deadbeef")
            .body(Body::from(body.to_vec()))
            .unwrap();
        let resp = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let executions = execution_db::list_executions(
            &app.pool,
            app.tenant,
            Some(workflow_id.parse().unwrap()),
            None,
            10,
        )
        .await
        .unwrap();
        assert_eq!(executions.len(), 1);

        // Unknown webhook id: 404.
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/webhooks/{workflow_id}/{}", Uuid::new_v4()))
            .body(Body::from(body.to_vec()))
            .unwrap();
        let resp = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        app.teardown().await;
    }

    #[tokio::test]
    async fn filter_sub_resource_and_test_endpoint() {
        let app = test_app().await;
        let (_workflow_id, webhook_id) = webhook_workflow(&app).await;

        let resp = app
            .post(
                &format!("/api/v1/webhooks/{webhook_id}/filters"),
                json!({
                    "field_path": "$.event",
                    "operator": "equals",
                    "value": "\"push\"",
                    "logic_group": 0
                }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .post(
                &format!("/api/v1/webhooks/{webhook_id}/filters/test"),
                json!({"payload": {"event": "push"}}),
            )
            .await;
        assert_eq!(body_json(resp).await["passes"], true);

        let resp = app
            .post(
                &format!("/api/v1/webhooks/{webhook_id}/filters/test"),
                json!({"payload": {"event": "pull"}}),
            )
            .await;
        assert_eq!(body_json(resp).await["passes"], false);

        let resp = app.get(&format!("/api/v1/webhooks/{webhook_id}/filters")).await;
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        app.teardown().await;
    }

    // -----------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn task_endpoints_cover_the_approval_flow() {
        let app = test_app().await;

        let resp = app
            .post(
                "/api/v1/workflows",
                json!({
                    "name": "needs-approval",
                    "status": "active",
                    "definition": {
                        "nodes": [
                            {"id": "start", "kind": "trigger:manual", "config": {}},
                            {"id": "approve", "kind": "human:task", "config": {
                                "title": "Sign-off",
                                "assignees": ["tester"],
                                "timeout_minutes": 30
                            }},
                            {"id": "after", "kind": "action:log", "config": {"message": "done"}}
                        ],
                        "edges": [
                            {"source": "start", "target": "approve"},
                            {"source": "approve", "target": "after"}
                        ]
                    }
                }),
            )
            .await;
        let workflow_id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        app.post(&format!("/api/v1/workflows/{workflow_id}/execute"), json!({}))
            .await;
        let suspended = app.drive_once().await;
        assert_eq!(suspended.status, ExecutionStatus::Suspended);

        let resp = app.get("/api/v1/tasks?status=pending").await;
        let tasks = body_json(resp).await;
        let task_id = tasks[0]["id"].as_str().unwrap().to_owned();

        let resp = app.get(&format!("/api/v1/tasks/{task_id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // The X-User-ID header ("tester") is the assignee, so approval
        // sticks; the escalation history endpoint answers too.
        let resp = app
            .post(
                &format!("/api/v1/tasks/{task_id}/approve"),
                json!({"comment": "lgtm"}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "approved");

        let resp = app.get(&format!("/api/v1/tasks/{task_id}/escalations")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Approving twice is a semantic rejection.
        let resp = app
            .post(&format!("/api/v1/tasks/{task_id}/approve"), json!({}))
            .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let done = app.drive_once().await;
        assert_eq!(done.status, ExecutionStatus::Completed);

        app.teardown().await;
    }

    // -----------------------------------------------------------------
    // End-to-end: parallel fail_fast against a live HTTP backend
    // -----------------------------------------------------------------

    #[tokio::test]
    async fn parallel_fail_fast_against_live_backend() {
        let app = test_app().await;

        // Branch 1 returns 500 immediately; branch 2 takes 200ms to
        // answer 200.
        let backend = Router::new()
            .route(
                "/api/branch1",
                axum::routing::get(|| async {
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                }),
            )
            .route(
                "/api/branch2",
                axum::routing::get(|| async {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    axum::Json(json!({"ok": true}))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let resp = app
            .post(
                "/api/v1/workflows",
                json!({
                    "name": "fanout",
                    "status": "active",
                    "definition": {
                        "nodes": [
                            {"id": "start", "kind": "trigger:manual", "config": {}},
                            {"id": "split", "kind": "control:parallel", "config": {
                                "branches": [
                                    {"name": "a", "nodes": ["call1"]},
                                    {"name": "b", "nodes": ["call2"]}
                                ],
                                "error_strategy": "fail_fast"
                            }},
                            {"id": "call1", "kind": "action:http",
                             "config": {"url": format!("http://{addr}/api/branch1")}},
                            {"id": "call2", "kind": "action:http",
                             "config": {"url": format!("http://{addr}/api/branch2")}}
                        ],
                        "edges": [{"source": "start", "target": "split"}]
                    }
                }),
            )
            .await;
        let workflow_id = body_json(resp).await["id"].as_str().unwrap().to_owned();

        app.post(&format!("/api/v1/workflows/{workflow_id}/execute"), json!({}))
            .await;

        let done = app.drive_once().await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        let message = done.error_message.unwrap();
        assert!(message.contains("500"), "error should reference the 500: {message}");

        app.teardown().await;
    }
}
