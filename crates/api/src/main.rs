use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidgen_api::background;
use vidgen_api::config::ServerConfig;
use vidgen_api::router::build_app_router;
use vidgen_api::state::AppState;
use vidgen_events::EventBus;
use vidgen_pipeline::{
    HttpProviderInvoker, PgScriptSource, PgStatusStore, PipelineConfig, PipelineCoordinator,
    ProviderSelector, StatusGateway, StatusStore,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let (json_layer, text_layer) = if json_logs {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "vidgen_api=debug,vidgen_pipeline=debug,tower_http=debug".into()
            }),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    let pipeline_config = PipelineConfig::from_env();
    tracing::info!(
        unit_concurrency = pipeline_config.unit_concurrency,
        max_unit_attempts = pipeline_config.max_unit_attempts,
        provider_gateway_url = %pipeline_config.provider_gateway_url,
        "Loaded pipeline configuration"
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = vidgen_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    vidgen_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    vidgen_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let event_log_handle = tokio::spawn(vidgen_events::log_events(event_bus.subscribe()));

    // --- Pipeline ---
    let store: Arc<dyn StatusStore> = Arc::new(PgStatusStore::new(pool.clone()));
    let invoker = HttpProviderInvoker::new(
        pipeline_config.provider_gateway_url.clone(),
        pipeline_config.provider_timeout,
    )
    .expect("Failed to build provider HTTP client");
    let sweep_interval = pipeline_config.recovery_sweep_interval;
    let coordinator = PipelineCoordinator::new(
        Arc::clone(&store),
        Arc::new(PgScriptSource::new(pool.clone())),
        Arc::new(invoker),
        ProviderSelector::new(),
        Arc::clone(&event_bus),
        pipeline_config,
    );
    tracing::info!("Pipeline coordinator started");

    // --- Recovery sweeper ---
    let recovery_cancel = CancellationToken::new();
    let recovery_handle = tokio::spawn(background::recovery::run(
        Arc::clone(&coordinator),
        sweep_interval,
        recovery_cancel.clone(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        coordinator,
        gateway: StatusGateway::new(Arc::clone(&store)),
        store,
        event_bus: Arc::clone(&event_bus),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    recovery_cancel.cancel();
    let _ = tokio::time::timeout(grace, recovery_handle).await;
    tracing::info!("Recovery sweeper stopped");

    // In-flight stage tasks are not awaited; the recovery sweep of the next
    // process picks up any run they leave behind.
    drop(event_bus);
    let _ = tokio::time::timeout(grace, event_log_handle).await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
