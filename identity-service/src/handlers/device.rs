use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};

use crate::{
    dtos::{
        device::{DeviceCodeRequest, TokenRequest, UserCodeRequest},
        MessageResponse,
    },
    middleware::{AuthUser, ClientOrigin},
    models::DeviceMetadata,
    services::{DeviceFlowError, ServiceError, DEVICE_CODE_GRANT_TYPE},
    utils::{OAuthPayload, ValidatedPayload},
    AppState,
};

const REFRESH_TOKEN_GRANT_TYPE: &str = "refresh_token";

fn subject_of(user: &AuthUser) -> Result<uuid::Uuid, DeviceFlowError> {
    user.0
        .subject_id()
        .map_err(|e| DeviceFlowError::Internal(anyhow::Error::new(e)))
}

/// Start a device authorization for a CLI client
pub async fn request_code(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    OAuthPayload(req): OAuthPayload<DeviceCodeRequest>,
) -> Result<impl IntoResponse, DeviceFlowError> {
    let res = state.device.request_code(&req.client_id, &origin).await?;
    Ok(Json(res))
}

/// OAuth token endpoint: device code polling and refresh token grants
pub async fn token(
    State(state): State<AppState>,
    ClientOrigin(origin): ClientOrigin,
    OAuthPayload(req): OAuthPayload<TokenRequest>,
) -> Result<impl IntoResponse, DeviceFlowError> {
    let tokens = match req.grant_type.as_str() {
        DEVICE_CODE_GRANT_TYPE => {
            let client_id = req.client_id.ok_or(DeviceFlowError::InvalidClient)?;
            let device_code = req.device_code.ok_or(DeviceFlowError::InvalidGrant)?;
            state.device.poll(&device_code, &client_id, &origin).await?
        }
        REFRESH_TOKEN_GRANT_TYPE => {
            let secret = req.refresh_token.ok_or(DeviceFlowError::InvalidGrant)?;
            let device = DeviceMetadata {
                client_id: req.client_id,
                ..DeviceMetadata::default()
            };
            state
                .sessions
                .refresh(&secret, device, &origin)
                .await
                .map_err(|e| match e {
                    ServiceError::Unauthorized(_)
                    | ServiceError::RotationFailed
                    | ServiceError::InvalidInput(_) => DeviceFlowError::InvalidGrant,
                    other => DeviceFlowError::Internal(anyhow::anyhow!(other)),
                })?
        }
        other => return Err(DeviceFlowError::UnsupportedGrantType(other.to_string())),
    };

    Ok(([(header::CACHE_CONTROL, "no-store")], Json(tokens)))
}

/// Show which client is asking before the user decides
pub async fn lookup(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(req): Query<UserCodeRequest>,
) -> Result<impl IntoResponse, DeviceFlowError> {
    let res = state.device.lookup(&req.user_code).await?;
    Ok(Json(res))
}

pub async fn authorize(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
    ValidatedPayload(req): ValidatedPayload<UserCodeRequest>,
) -> Result<impl IntoResponse, DeviceFlowError> {
    let subject_id = subject_of(&user)?;
    state
        .device
        .authorize(&req.user_code, subject_id, &origin)
        .await?;
    Ok(Json(MessageResponse::new(
        "Device authorized. Return to your terminal.",
    )))
}

pub async fn deny(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
    ValidatedPayload(req): ValidatedPayload<UserCodeRequest>,
) -> Result<impl IntoResponse, DeviceFlowError> {
    let subject_id = subject_of(&user)?;
    state.device.deny(&req.user_code, subject_id, &origin).await?;
    Ok(Json(MessageResponse::new("Device request denied")))
}
