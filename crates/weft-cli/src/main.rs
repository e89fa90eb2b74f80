mod config;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use weft_core::engine::{Engine, EngineConfig, run_maintenance, run_worker};
use weft_core::humantask::TaskManager;
use weft_core::humantask::escalation::run_overdue_scanner;
use weft_core::nodes::ExecutorRegistry;
use weft_core::notify::{InAppSink, LogSink, Notifier};
use weft_core::schedule::dispatcher::{DispatcherConfig, run_schedule_dispatcher};
use weft_db::config::DbConfig;
use weft_db::pool;

use config::ServeConfig;

#[derive(Parser)]
#[command(name = "weft", about = "Multi-tenant workflow orchestration engine")]
struct Cli {
    /// Database URL (overrides WEFT_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and apply migrations
    DbInit,
    /// Run the HTTP control plane and data plane
    Serve {
        /// Interface to bind
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the engine workers, overdue scanner, and schedule dispatcher
    Worker {
        /// Number of concurrent engine workers
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run the HTTP server and the workers in one process
    Run {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let db_config = match &cli.database_url {
        Some(url) => DbConfig::from_url(url.clone()),
        None => DbConfig::from_env(),
    };

    match cli.command {
        Commands::DbInit => db_init(&db_config).await,
        Commands::Serve { bind, port } => {
            let mut serve_config = ServeConfig::from_env();
            if let Some(bind) = bind {
                serve_config.bind = bind;
            }
            if let Some(port) = port {
                serve_config.port = port;
            }
            let runtime = Runtime::connect(&db_config).await?;
            runtime.serve(&serve_config).await
        }
        Commands::Worker { workers } => {
            let mut serve_config = ServeConfig::from_env();
            if let Some(workers) = workers {
                serve_config.workers = workers;
            }
            let runtime = Runtime::connect(&db_config).await?;
            runtime.work(&serve_config).await
        }
        Commands::Run {
            bind,
            port,
            workers,
        } => {
            let mut serve_config = ServeConfig::from_env();
            if let Some(bind) = bind {
                serve_config.bind = bind;
            }
            if let Some(port) = port {
                serve_config.port = port;
            }
            if let Some(workers) = workers {
                serve_config.workers = workers;
            }
            let runtime = Runtime::connect(&db_config).await?;
            runtime.run_all(&serve_config).await
        }
    }
}

async fn db_init(db_config: &DbConfig) -> Result<()> {
    pool::ensure_database_exists(db_config).await?;
    let pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&pool).await?;

    let counts = pool::table_counts(&pool).await?;
    println!("database initialised ({} tables):", counts.len());
    for (table, count) in counts {
        println!("  {table}: {count} rows");
    }
    Ok(())
}

/// Shared wiring for the serve / worker / run commands.
struct Runtime {
    pool: sqlx::PgPool,
    engine: Arc<Engine>,
}

impl Runtime {
    async fn connect(db_config: &DbConfig) -> Result<Self> {
        let pool = pool::create_pool(db_config)
            .await
            .context("failed to connect to the database")?;

        let notifier = Notifier::new(vec![
            Arc::new(LogSink),
            Arc::new(InAppSink::new(pool.clone())),
        ]);
        let tasks = TaskManager::new(pool.clone(), notifier.clone());
        let registry = Arc::new(ExecutorRegistry::with_builtins());
        let engine = Arc::new(Engine::new(
            pool.clone(),
            registry,
            tasks,
            notifier,
            EngineConfig::default(),
        ));

        Ok(Self { pool, engine })
    }

    async fn serve(&self, config: &ServeConfig) -> Result<()> {
        server::run_server(
            self.pool.clone(),
            Arc::clone(&self.engine),
            &config.bind,
            config.port,
        )
        .await
    }

    async fn work(&self, config: &ServeConfig) -> Result<()> {
        let cancel = CancellationToken::new();
        let handles = self.spawn_workers(config, cancel.clone());

        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        tracing::info!("shutdown signal received");
        cancel.cancel();

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn run_all(&self, config: &ServeConfig) -> Result<()> {
        let cancel = CancellationToken::new();
        let handles = self.spawn_workers(config, cancel.clone());

        let result = self.serve(config).await;

        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        result
    }

    fn spawn_workers(
        &self,
        config: &ServeConfig,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        for i in 0..config.workers.max(1) {
            let engine = Arc::clone(&self.engine);
            let token = cancel.clone();
            let worker_id = format!("worker-{i}");
            handles.push(tokio::spawn(run_worker(engine, worker_id, token)));
        }

        handles.push(tokio::spawn(run_maintenance(
            self.pool.clone(),
            self.engine.config().claim_ttl_secs,
            std::time::Duration::from_secs(5),
            cancel.clone(),
        )));

        handles.push(tokio::spawn(run_overdue_scanner(
            self.engine.tasks().clone(),
            std::time::Duration::from_secs(10),
            cancel.clone(),
        )));

        handles.push(tokio::spawn(run_schedule_dispatcher(
            self.pool.clone(),
            Arc::clone(&self.engine),
            DispatcherConfig::default(),
            cancel,
        )));

        handles
    }
}
