use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quantimage_api::config::ServerConfig;
use quantimage_api::router::build_app_router;
use quantimage_api::state::AppState;
use quantimage_api::ws;
use quantimage_events::{BusPublisher, EventBus, PgEventRelay};
use quantimage_pipeline::{ExtractionContext, QueueBackend};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid server configuration: {e}");
            std::process::exit(1);
        }
    };

    // --- Tracing ---
    init_tracing(config.json_logs);
    tracing::info!(
        host = %config.host,
        port = %config.port,
        queue = ?config.pipeline.queue_backend,
        "Loaded server configuration",
    );

    // --- Database ---
    let pool = match quantimage_db::create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => fatal("Failed to connect to database", e),
    };
    tracing::info!("Database connection pool created");

    if let Err(e) = quantimage_db::health_check(&pool).await {
        fatal("Database health check failed", e);
    }
    if let Err(e) = quantimage_db::run_migrations(&pool).await {
        fatal("Failed to run database migrations", e);
    }
    tracing::info!("Database migrations applied");

    // --- Event bus ---
    let bus = Arc::new(EventBus::default());
    let publisher = Arc::new(BusPublisher::new(Arc::clone(&bus)));
    let background_cancel = CancellationToken::new();

    // Worker processes publish over pg_notify; relay them onto the bus.
    let relay_handle = (config.pipeline.queue_backend == QueueBackend::Postgres).then(|| {
        let relay = PgEventRelay::new(pool.clone(), Arc::clone(&bus));
        let cancel = background_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = relay.run(cancel).await {
                tracing::error!(error = %e, "Event relay stopped");
            }
        })
    });

    // --- Extraction runtime ---
    let ctx = match ExtractionContext::from_config(
        &config.pipeline,
        pool.clone(),
        Arc::clone(&bus),
        publisher,
    ) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => fatal("Failed to build extraction context", e),
    };
    tracing::info!("Extraction context ready");

    // The in-process pool lost whatever it held when the last process
    // stopped. Worker processes recover the shared queue themselves.
    if config.pipeline.queue_backend == QueueBackend::Local {
        match ctx.dispatcher.recover_orphans().await {
            Ok(outcome) => tracing::info!(
                resubmitted = outcome.resubmitted,
                failed = outcome.failed,
                "Startup task recovery finished",
            ),
            Err(e) => tracing::error!(error = %e, "Startup task recovery failed"),
        }
    }

    // --- WebSocket manager ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));
    let forwarder_handle = tokio::spawn(ws::forwarder::run(
        Arc::clone(&ws_manager),
        bus.subscribe(),
        background_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        ctx: Arc::clone(&ctx),
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        pool: Some(pool),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = match config.host.parse::<std::net::IpAddr>() {
        Ok(host) => host,
        Err(e) => fatal("Invalid HOST address", e),
    };
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => fatal("Failed to bind to address", e),
    };

    // Open sockets would hold graceful shutdown forever; close them first.
    let closing = Arc::clone(&ws_manager);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            closing.shutdown_all().await;
        })
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    // Let in-process tasks finish so their terminal states are written.
    if tokio::time::timeout(grace, ctx.shutdown()).await.is_err() {
        tracing::warn!("Local workers did not finish before shutdown timeout");
    }

    background_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), forwarder_handle).await;
    if let Some(handle) = relay_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    tracing::info!("Event services shut down");

    let ws_count = ws_manager.connection_count().await;
    if ws_count > 0 {
        tracing::info!(ws_count, "Closing remaining WebSocket connections");
        ws_manager.shutdown_all().await;
    }

    heartbeat_handle.abort();
    tracing::info!("Graceful shutdown complete");
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "quantimage_api=debug,quantimage_pipeline=debug,tower_http=debug".into()
    });

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

fn fatal(what: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!(error = %err, "{what}");
    std::process::exit(1);
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
