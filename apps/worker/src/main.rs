//! Maestro engine worker
//!
//! Hosts the workflow engine: connects the durable and coordination
//! stores, seeds the built-in definitions, re-adopts instances left
//! running by a crashed worker, and serves until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use maestro_common::init_tracing;
use maestro_db::{
    CoordinationStore, InstanceStore, PgDefinitionStore, PgInstanceStore, RedisConfig,
    RedisCoordinationStore,
};
use maestro_workflow_engine::{
    DefinitionRegistry, EventBus, EventKind, LocalDispatcher, NatsDispatcher, TaskDispatcher,
    WorkflowEngine,
};

const LIFECYCLE_EVENTS: [EventKind; 10] = [
    EventKind::WorkflowStarted,
    EventKind::StepStarted,
    EventKind::StepCompleted,
    EventKind::StepFailed,
    EventKind::StepRetrying,
    EventKind::WorkflowCompleted,
    EventKind::WorkflowFailed,
    EventKind::WorkflowCancelled,
    EventKind::WorkflowPaused,
    EventKind::WorkflowResumed,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    tracing::info!("Starting Maestro worker...");

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set (postgres://...)")?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let coordination: Arc<dyn CoordinationStore> = Arc::new(
        RedisCoordinationStore::connect(&RedisConfig { url: redis_url })
            .context("failed to create Redis pool")?,
    );

    let dispatcher: Arc<dyn TaskDispatcher> = match std::env::var("NATS_URL") {
        Ok(nats_url) => {
            tracing::info!(url = %nats_url, "dispatching tasks over NATS");
            Arc::new(
                NatsDispatcher::connect(&nats_url)
                    .await
                    .context("failed to connect to NATS")?,
            )
        }
        Err(_) => {
            tracing::warn!(
                "NATS_URL not set, using the in-process dispatcher; \
                 only locally registered tasks will run"
            );
            Arc::new(LocalDispatcher::new())
        }
    };

    let registry = Arc::new(DefinitionRegistry::new(Arc::new(PgDefinitionStore::new(
        pool.clone(),
    ))));
    registry
        .seed_builtins()
        .await
        .context("failed to seed built-in workflows")?;

    let instances: Arc<dyn InstanceStore> = Arc::new(PgInstanceStore::new(pool));
    let events = Arc::new(EventBus::new());
    for kind in LIFECYCLE_EVENTS {
        events.subscribe(kind, |event| {
            tracing::info!(
                event = event.kind.as_str(),
                instance_id = %event.instance_id,
                step_id = event.step_id.as_deref().unwrap_or(""),
                "workflow event"
            );
            Ok(())
        });
    }

    let engine = Arc::new(WorkflowEngine::new(
        registry,
        instances,
        coordination,
        dispatcher,
        events,
    ));

    let adopted = engine.resume_interrupted().await?;
    if !adopted.is_empty() {
        tracing::info!(count = adopted.len(), "re-adopted interrupted instances");
    }

    tracing::info!("Worker started. Waiting for submissions...");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down worker...");

    Ok(())
}
