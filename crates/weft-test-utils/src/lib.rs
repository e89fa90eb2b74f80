//! Integration-test support for the weft workspace.
//!
//! Tests share one PostgreSQL server — an external one when
//! `WEFT_TEST_PG_URL` is set (e.g. by a nextest setup script), otherwise a
//! testcontainers instance started lazily per test binary — and each test
//! gets its own migrated database through a [`TestDb`] handle.
//!
//! Beyond isolation, the handle carries seed helpers for the rows nearly
//! every weft integration test starts from (a tenant with a workflow), so
//! individual tests only spell out what they actually exercise.

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use weft_db::models::{Workflow, WorkflowStatus};
use weft_db::pool::run_migrations;
use weft_db::queries::workflows::{NewWorkflow, insert_workflow};

/// The shared server: its root URL and, when testcontainers started it,
/// the container handle kept alive for the life of the test binary.
struct PgServer {
    base_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn pg_server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(base_url) = std::env::var("WEFT_TEST_PG_URL") {
                return PgServer {
                    base_url,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("postgres test container should start");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container mapped port");

            PgServer {
                base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// One-connection pool to the server's `postgres` database, for CREATE /
/// DROP DATABASE statements.
async fn admin_pool() -> PgPool {
    let server = pg_server().await;
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .connect(&format!("{}/postgres", server.base_url))
        .await
        .expect("admin connection to test server")
}

/// A migrated, uniquely-named database for one test.
///
/// Create with [`TestDb::new`], reach the store through `pool`, and call
/// [`TestDb::close`] at the end — skipping it leaks a database in the
/// shared server.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    /// Create a fresh database on the shared server and apply the weft
    /// migrations to it.
    pub async fn new() -> Self {
        let name = format!("weft_test_{}", Uuid::new_v4().simple());

        let admin = admin_pool().await;
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create test database {name}: {e}"));
        admin.close().await;

        let server = pg_server().await;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(&format!("{}/{name}", server.base_url))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to test database {name}: {e}"));

        run_migrations(&pool)
            .await
            .expect("migrations should apply cleanly");

        Self { pool, name }
    }

    /// Seed an `active` workflow with a generated name for the tenant.
    ///
    /// Most engine tests start from exactly this row; the generated name
    /// keeps repeated seeds clear of the per-tenant uniqueness constraint.
    pub async fn seed_workflow(&self, tenant_id: Uuid, definition: &Value) -> Workflow {
        self.seed_workflow_with_status(tenant_id, WorkflowStatus::Active, definition)
            .await
    }

    /// Seed a workflow in an explicit status (draft, inactive, ...).
    pub async fn seed_workflow_with_status(
        &self,
        tenant_id: Uuid,
        status: WorkflowStatus,
        definition: &Value,
    ) -> Workflow {
        insert_workflow(
            &self.pool,
            &NewWorkflow {
                tenant_id,
                name: &format!("wf-{}", Uuid::new_v4().simple()),
                status,
                definition,
            },
        )
        .await
        .expect("seed workflow insert should succeed")
    }

    /// Tear the database down: close the pool, kick any stray connections,
    /// and drop the database. Safe to call even if a drop already happened.
    pub async fn close(self) {
        self.pool.close().await;

        let admin = admin_pool().await;
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = admin.execute(terminate.as_str()).await;
        let _ = admin
            .execute(format!("DROP DATABASE IF EXISTS {}", self.name).as_str())
            .await;
        admin.close().await;
    }
}
