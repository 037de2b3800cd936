//! `quantimage-worker` -- extraction task worker.
//!
//! Claims task invocations from the PostgreSQL work queue and runs the
//! extraction pipeline for each. Task events go out over `pg_notify` so
//! the API process can relay them to subscribers.

use std::sync::Arc;
use std::time::Duration;

use quantimage_events::{EventBus, PgNotifyPublisher};
use quantimage_pipeline::pg_queue::PgQueue;
use quantimage_pipeline::ExtractionContext;
use quantimage_worker::config::WorkerConfig;
use quantimage_worker::runner::{Maintenance, WorkerRuntime};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid worker configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.json_logs);

    tracing::info!(
        worker = %config.worker_name,
        concurrency = config.pipeline.worker_concurrency,
        "Starting quantimage-worker",
    );

    let pool = match quantimage_db::create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            std::process::exit(1);
        }
    };
    if let Err(e) = quantimage_db::health_check(&pool).await {
        tracing::error!(error = %e, "Database health check failed");
        std::process::exit(1);
    }

    // Events are relayed by the API; the local bus has no subscribers.
    let bus = Arc::new(EventBus::default());
    let publisher = Arc::new(PgNotifyPublisher::new(pool.clone()));
    let ctx = match ExtractionContext::from_config(&config.pipeline, pool.clone(), bus, publisher) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build extraction context");
            std::process::exit(1);
        }
    };

    let runtime = WorkerRuntime::new(
        Arc::new(PgQueue::new(pool)),
        Arc::clone(&ctx.processor),
        config.worker_name.clone(),
        config.pipeline.worker_concurrency,
        config.poll_interval,
    )
    .with_maintenance(Maintenance {
        dispatcher: Arc::clone(&ctx.dispatcher),
        lease: config.lease,
        retention: config.queue_retention,
        interval: config.sweep_interval,
    });

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    // In-flight pipelines may be long; leave them a bounded window.
    if tokio::time::timeout(Duration::from_secs(60), handle).await.is_err() {
        tracing::warn!("In-flight tasks did not finish before shutdown timeout");
    }
    ctx.shutdown().await;
    tracing::info!("Worker shut down");
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "quantimage_worker=debug,quantimage_pipeline=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
