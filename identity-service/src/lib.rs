pub mod clock;
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use chrono::Duration;
use service_core::error::AppError;
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::services::{
    AccountLifecycleService, AuditLogService, DeviceAuthorizationService, JwtService,
    MaintenanceRunner, RefreshTokenStore, SessionService, TokenBlacklist,
};
use crate::store::{HealthCheck, Stores};

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub sessions: SessionService,
    pub device: DeviceAuthorizationService,
    pub accounts: AccountLifecycleService,
    pub audit: AuditLogService,
    pub blacklist: Arc<dyn TokenBlacklist>,
    pub health: Arc<dyn HealthCheck>,
    pub clock: Arc<dyn Clock>,
    refresh_tokens: RefreshTokenStore,
}

impl AppState {
    /// Wire every service over one set of stores and one clock.
    pub fn new(
        config: IdentityConfig,
        stores: Stores,
        blacklist: Arc<dyn TokenBlacklist>,
        jwt: JwtService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditLogService::new(stores.audit.clone(), clock.clone());
        let refresh_tokens = RefreshTokenStore::new(
            stores.refresh_tokens.clone(),
            clock.clone(),
            Duration::days(config.jwt.refresh_token_expiry_days),
        );
        let sessions = SessionService::new(
            stores.accounts.clone(),
            jwt,
            refresh_tokens.clone(),
            blacklist.clone(),
            audit.clone(),
            clock.clone(),
        );
        let device = DeviceAuthorizationService::new(
            &config.device,
            stores.device_codes.clone(),
            sessions.clone(),
            audit.clone(),
            clock.clone(),
        );
        let accounts = AccountLifecycleService::new(
            stores.accounts.clone(),
            audit.clone(),
            clock.clone(),
            config.account.deletion_grace_days,
        );

        Self {
            config,
            sessions,
            device,
            accounts,
            audit,
            blacklist,
            health: stores.health,
            clock,
            refresh_tokens,
        }
    }

    /// Background housekeeping over the same services the router uses.
    pub fn maintenance_runner(&self) -> MaintenanceRunner {
        MaintenanceRunner::new(
            self.accounts.clone(),
            self.refresh_tokens.clone(),
            self.device.clone(),
            self.audit.clone(),
            self.clock.clone(),
            self.config.audit.retention_days,
            std::time::Duration::from_secs(self.config.maintenance.interval_seconds),
        )
    }
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let protected = Router::new()
        .route("/device/lookup", get(handlers::device::lookup))
        .route("/device/authorize", post(handlers::device::authorize))
        .route("/device/deny", post(handlers::device::deny))
        .route("/auth/logout", post(handlers::session::logout))
        .route("/auth/revoke", post(handlers::session::revoke))
        .route("/auth/revoke-all", post(handlers::session::revoke_all))
        .route(
            "/account/deletion",
            post(handlers::account::request_deletion).delete(handlers::account::cancel_deletion),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/oauth/device/code", post(handlers::device::request_code))
        .route("/oauth/token", post(handlers::device::token))
        .route("/auth/refresh", post(handlers::session::refresh))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span))
        .layer(from_fn(request_id_middleware));

    Ok(app)
}

/// Service health check
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::Json<serde_json::Value>, AppError> {
    state.health.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Storage health check failed");
        AppError::DatabaseError(e)
    })?;

    state.blacklist.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Blacklist health check failed");
        AppError::InternalError(e)
    })?;

    Ok(axum::Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "storage": "up",
            "blacklist": "up"
        }
    })))
}
