use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{account::DeletionRequestedResponse, MessageResponse},
    middleware::{AuthUser, ClientOrigin},
    services::ServiceError,
    AppState,
};

/// Schedule the caller's account for deletion after the grace period
pub async fn request_deletion(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
) -> Result<impl IntoResponse, AppError> {
    let subject_id = user.0.subject_id().map_err(ServiceError::from)?;
    let schedule = state.accounts.request_deletion(subject_id, &origin).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DeletionRequestedResponse {
            message: "Account scheduled for deletion".to_string(),
            schedule,
        }),
    ))
}

pub async fn cancel_deletion(
    State(state): State<AppState>,
    user: AuthUser,
    ClientOrigin(origin): ClientOrigin,
) -> Result<impl IntoResponse, AppError> {
    let subject_id = user.0.subject_id().map_err(ServiceError::from)?;
    state.accounts.cancel_deletion(subject_id, &origin).await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse::new("Account deletion cancelled")),
    ))
}
