//! Stepflow worker process
//!
//! Runs the worker loops, scheduler and outbox relay against PostgreSQL when
//! `DATABASE_URL` is set, otherwise against in-memory backends.

mod seed;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use stepflow_engine::coordination::{
    IdempotencyStore, InMemoryIdempotencyStore, InMemoryLockManager, LockManager,
    PostgresIdempotencyStore, PostgresLockManager,
};
use stepflow_engine::engine::{WorkflowExecutor, WorkflowService};
use stepflow_engine::handlers::{EchoAiClient, HandlerRegistry};
use stepflow_engine::messaging::{ChannelEventBroadcaster, LoggingQueuePublisher, QueuePublisher};
use stepflow_engine::observability::EngineMetrics;
use stepflow_engine::persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, WorkflowStore};
use stepflow_engine::worker::{DispatchQueue, OutboxRelay, Scheduler, WorkerPool};
use stepflow_engine::EngineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Backends {
    store: Arc<dyn WorkflowStore>,
    locks: Arc<dyn LockManager>,
    idempotency: Arc<dyn IdempotencyStore>,
}

async fn connect_backends() -> Result<Backends> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        tracing::warn!("DATABASE_URL not set, using in-memory backends (state is lost on exit)");
        return Ok(Backends {
            store: Arc::new(InMemoryWorkflowStore::new()),
            locks: Arc::new(InMemoryLockManager::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        });
    };

    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresWorkflowStore::new(pool.clone());
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    Ok(Backends {
        store: Arc::new(store),
        locks: Arc::new(PostgresLockManager::new(pool.clone())),
        idempotency: Arc::new(PostgresIdempotencyStore::new(pool)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before the subscriber reads RUST_LOG
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepflow_engine=info,stepflow_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("stepflow-worker starting...");
    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }

    let config = EngineConfig::from_env();
    tracing::info!(
        worker_count = config.worker_count,
        lease_ttl = ?config.lease_ttl,
        scheduler_interval = ?config.scheduler_interval,
        "Engine configured"
    );

    let backends = connect_backends().await?;
    let metrics = Arc::new(EngineMetrics::new());
    let publisher: Arc<dyn QueuePublisher> = Arc::new(LoggingQueuePublisher);
    let broadcaster = Arc::new(ChannelEventBroadcaster::default());
    let queue = Arc::new(DispatchQueue::new());

    let executor = WorkflowExecutor::new(
        backends.store.clone(),
        backends.locks.clone(),
        HandlerRegistry::standard(Arc::new(EchoAiClient), publisher.clone()),
    )
    .with_broadcaster(broadcaster)
    .with_metrics(metrics.clone())
    .with_config(&config);

    let service = WorkflowService::new(
        backends.store.clone(),
        backends.idempotency,
        backends.locks,
        queue.clone(),
    )
    .with_config(&config);

    let seeded = seed::seed_samples(&service).await?;
    if seeded > 0 {
        tracing::info!(count = seeded, "Sample workflows installed");
    }

    let scheduler = Scheduler::new(backends.store.clone(), queue.clone(), config.clone());
    let relay = OutboxRelay::new(backends.store, publisher, config.clone()).with_metrics(metrics.clone());

    let pool = WorkerPool::new(
        Arc::new(executor),
        queue,
        Arc::new(scheduler),
        Arc::new(relay),
        config,
    );
    pool.start().context("Failed to start worker pool")?;
    tracing::info!("Worker ready, waiting for shutdown signal...");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    pool.shutdown().await.context("Worker pool did not stop cleanly")?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        completed = snapshot.instances_completed,
        retries = snapshot.step_retries,
        dead_letters = snapshot.dead_letters,
        outbox_published = snapshot.outbox_published,
        "Worker shutdown complete"
    );
    Ok(())
}
