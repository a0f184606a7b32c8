use identity_service::{
    build_router,
    clock::{Clock, SystemClock},
    config::{BlacklistBackend, IdentityConfig, StorageBackend},
    services::{metrics::init_metrics, InMemoryBlacklist, JwtService, RedisService, TokenBlacklist},
    store::{create_pool, run_migrations, MemoryStore, PgStore, Stores},
    AppState,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    init_metrics().map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = match config.storage {
        StorageBackend::Postgres => {
            tracing::info!("Initializing database connection pool");
            let pool = create_pool(&config.database)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            tracing::info!("Database initialized successfully");
            Stores::postgres(PgStore::new(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Stores::memory(Arc::new(MemoryStore::new()))
        }
    };

    let blacklist: Arc<dyn TokenBlacklist> = match config.blacklist {
        BlacklistBackend::Redis => {
            let redis = RedisService::new(&config.redis).await?;
            tracing::info!("Redis service initialized");
            Arc::new(redis)
        }
        BlacklistBackend::Memory => Arc::new(InMemoryBlacklist::new(clock.clone())),
    };

    let jwt = JwtService::new(&config.jwt, clock.clone())?;
    tracing::info!("JWT service initialized");

    let state = AppState::new(config.clone(), stores, blacklist, jwt, clock);
    let maintenance = state.maintenance_runner().start();

    let app = build_router(state).await?;

    let addr = config.common.socket_addr()?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    maintenance.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
