use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{LogoutRequest, RefreshRequest, RevokeAllResponse, RevokeRequest},
        MessageResponse,
    },
    middleware::{AuthUser, ClientOrigin},
    models::DeviceMetadata,
    utils::ValidatedJson,
    AppState,
};

/// Exchange a refresh token for a new token pair
pub async fn refresh(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let device = DeviceMetadata {
        device_name: req.device_name,
        ..DeviceMetadata::default()
    };
    let res = state
        .sessions
        .refresh(&req.refresh_token, device, &origin)
        .await?;
    Ok((StatusCode::OK, Json(res)))
}

/// Logout and invalidate tokens
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
    req: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let refresh_token = req.and_then(|Json(body)| body.refresh_token);
    state
        .sessions
        .logout(&user.0, refresh_token.as_deref(), &origin)
        .await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse::new("Logged out successfully")),
    ))
}

/// Revoke one refresh token of the caller
pub async fn revoke(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
    ValidatedJson(req): ValidatedJson<RevokeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let revoked = state
        .sessions
        .revoke(&user.0, &req.refresh_token, &origin)
        .await?;
    if !revoked {
        tracing::debug!(sub = %user.0.sub, "Revoke request matched no owned token");
    }
    Ok((StatusCode::OK, Json(MessageResponse::new("Token revoked"))))
}

/// Sign out everywhere
pub async fn revoke_all(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
) -> Result<impl IntoResponse, AppError> {
    let count = state.sessions.revoke_all(&user.0, &origin).await?;
    Ok((
        StatusCode::OK,
        Json(RevokeAllResponse {
            message: "All sessions revoked".to_string(),
            count,
        }),
    ))
}
