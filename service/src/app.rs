//! Process lifecycle: compose, start, serve, shut down.

use crate::audit::TracingAuditSink;
use crate::config::ServiceConfig;
use crate::source_of_record::HttpSourceOfRecord;
use anyhow::Context;
use axum::{Router, routing::get};
use inventory_sync_core::dead_letter::DeadLetterStore;
use inventory_sync_core::environment::SystemClock;
use inventory_sync_core::event_bus::EventSource;
use inventory_sync_core::policy::NoPendingReceipts;
use inventory_sync_postgres::PostgresDeadLetterStore;
use inventory_sync_redpanda::RedpandaEventSource;
use inventory_sync_runtime::metrics::MetricsServer;
use inventory_sync_runtime::{
    Collaborators, InMemoryDeadLetterStore, IngestionConsumer, SafetyStockTable, SyncEngine,
};
use inventory_sync_web::AppState;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// A named background task.
pub type Task = (&'static str, JoinHandle<()>);

/// Open the dead-letter store: Postgres when a URL is configured, memory otherwise.
///
/// # Errors
///
/// Returns an error if Postgres is configured but unreachable or cannot be
/// migrated.
pub async fn open_dead_letter_store(
    database_url: Option<&str>,
) -> anyhow::Result<Arc<dyn DeadLetterStore>> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; dead letters are kept in memory only");
        return Ok(Arc::new(InMemoryDeadLetterStore::new()));
    };
    let store = PostgresDeadLetterStore::connect(url)
        .await
        .context("Failed to connect to dead-letter database")?;
    store
        .migrate()
        .await
        .context("Failed to migrate dead-letter database")?;
    tracing::info!("Dead-letter store: PostgreSQL");
    Ok(Arc::new(store))
}

/// Production collaborators around a dead-letter store.
///
/// # Errors
///
/// Returns an error if the source-of-record URL is unusable.
pub fn collaborators(
    config: &ServiceConfig,
    dead_letter_store: Arc<dyn DeadLetterStore>,
) -> anyhow::Result<Collaborators> {
    let source_of_record = HttpSourceOfRecord::new(
        &config.source_of_record_url,
        config.sync.source_of_record_timeout,
    )
    .context("Invalid SOURCE_OF_RECORD_URL")?;

    Ok(Collaborators {
        clock: Arc::new(SystemClock),
        audit: Arc::new(TracingAuditSink),
        dead_letter_store,
        receipts: Arc::new(NoPendingReceipts),
        source_of_record: Arc::new(source_of_record),
        safety_stock: Arc::new(SafetyStockTable::new(config.sync.default_safety_stock)),
    })
}

/// Wait for every task, giving up after `timeout`.
///
/// Returns the names of the tasks that had not finished; those are aborted.
pub async fn join_with_timeout(tasks: Vec<Task>, timeout: Duration) -> Vec<&'static str> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut unfinished = Vec::new();

    for (name, mut handle) in tasks {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task failed"),
            Err(_) => {
                tracing::warn!(task = name, "Task did not stop in time; aborting");
                handle.abort();
                unfinished.push(name);
            },
        }
    }
    unfinished
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

fn metrics_router(metrics: Arc<MetricsServer>) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let metrics = Arc::clone(&metrics);
            async move { metrics.render().unwrap_or_default() }
        }),
    )
}

async fn serve(
    name: &'static str,
    addr: std::net::SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {name} listener on {addr}"))?;
    tracing::info!(listener = name, %addr, "Listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(listener = name, error = %e, "HTTP server failed");
        }
    }))
}

async fn on_shutdown(mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}

/// Run the service until a shutdown signal.
///
/// # Errors
///
/// Returns an error if startup fails: metrics, the dead-letter store, the
/// broker client or a listener.
pub async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let mut metrics = MetricsServer::new(config.server.metrics_addr());
    metrics.start().context("Failed to start metrics")?;
    let metrics = Arc::new(metrics);

    let dead_letter_store = open_dead_letter_store(config.database_url.as_deref()).await?;
    let engine = SyncEngine::new(
        config.sync.clone(),
        collaborators(&config, dead_letter_store)?,
    );

    let source: Arc<dyn EventSource> = Arc::new(
        RedpandaEventSource::builder()
            .brokers(&config.broker.brokers)
            .consumer_group(&config.broker.consumer_group)
            .build()
            .context("Failed to create broker client")?,
    );

    let (shutdown, _) = broadcast::channel(1);
    let mut tasks = engine.spawn_background(&shutdown);
    tasks.push((
        "ingestion-consumer",
        IngestionConsumer::new(
            "inventory-ingest",
            vec![config.broker.topic.clone()],
            source,
            Arc::clone(engine.pipeline()),
            shutdown.subscribe(),
        )
        .with_workers(config.broker.workers)
        .spawn(),
    ));

    let state = AppState::from_engine(&engine);
    tasks.push((
        "metrics-http",
        serve(
            "metrics",
            config.server.metrics_addr(),
            metrics_router(metrics),
            on_shutdown(shutdown.subscribe()),
        )
        .await?,
    ));
    tasks.push((
        "api-http",
        serve(
            "api",
            config.server.api_addr(),
            inventory_sync_web::router(state.clone()),
            on_shutdown(shutdown.subscribe()),
        )
        .await?,
    ));

    state.set_ready(true);
    tracing::info!(
        topic = %config.broker.topic,
        workers = config.broker.workers,
        "Inventory sync service started"
    );

    shutdown_signal().await;
    state.set_ready(false);
    let _ = shutdown.send(());

    let unfinished = join_with_timeout(tasks, config.server.shutdown_timeout).await;
    if unfinished.is_empty() {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!(?unfinished, "Shutdown timed out");
    }
    Ok(())
}
