use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Access token verification and signing failures.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Signature and issuer checked out; `subject` is the decoded `sub`.
    #[error("Token expired")]
    Expired { subject: Option<Uuid> },

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// Device authorization grant failures. The first eight variants are the
/// RFC 8628 / RFC 6749 error codes polling clients match on.
#[derive(Error, Debug)]
pub enum DeviceFlowError {
    #[error("The authorization request is still pending")]
    AuthorizationPending,

    #[error("Polling too frequently")]
    SlowDown,

    #[error("The user denied the authorization request")]
    AccessDenied,

    #[error("The device code has expired")]
    ExpiredToken,

    #[error("The device code is invalid or has already been used")]
    InvalidGrant,

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Malformed request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("Unknown client: {0}")]
    ClientUnknown(String),

    #[error("The user code has already been processed")]
    AlreadyProcessed,

    #[error("The user code has expired")]
    Expired,

    #[error("Unknown user code")]
    NotFound,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DeviceFlowError {
    /// Machine-readable code for the `error` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFlowError::AuthorizationPending => "authorization_pending",
            DeviceFlowError::SlowDown => "slow_down",
            DeviceFlowError::AccessDenied => "access_denied",
            DeviceFlowError::ExpiredToken => "expired_token",
            DeviceFlowError::InvalidGrant => "invalid_grant",
            DeviceFlowError::InvalidClient | DeviceFlowError::ClientUnknown(_) => "invalid_client",
            DeviceFlowError::InvalidRequest(_) => "invalid_request",
            DeviceFlowError::UnsupportedGrantType(_) => "unsupported_grant_type",
            DeviceFlowError::AlreadyProcessed => "already_processed",
            DeviceFlowError::Expired => "expired",
            DeviceFlowError::NotFound => "not_found",
            DeviceFlowError::Internal(_) => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DeviceFlowError::InvalidClient | DeviceFlowError::ClientUnknown(_) => {
                StatusCode::UNAUTHORIZED
            }
            DeviceFlowError::AlreadyProcessed => StatusCode::CONFLICT,
            DeviceFlowError::NotFound => StatusCode::NOT_FOUND,
            DeviceFlowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    error_description: String,
}

impl IntoResponse for DeviceFlowError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let description = match &self {
            DeviceFlowError::Internal(e) => {
                tracing::error!(error = %e, "Device flow internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(OAuthErrorBody {
                error: self.as_str(),
                error_description: description,
            }),
        )
            .into_response()
    }
}

/// Errors from session and account operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Account deletion is already pending")]
    AlreadyPending,

    #[error("Account deletion is not pending")]
    NotPending,

    #[error("Refresh token rotation failed")]
    RotationFailed,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn storage(err: anyhow::Error) -> Self {
        ServiceError::Storage(err)
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(e) => ServiceError::Internal(anyhow::anyhow!(e)),
            other => ServiceError::Unauthorized(other.to_string()),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            ServiceError::AlreadyPending => {
                AppError::Conflict(anyhow::anyhow!("Account deletion is already pending"))
            }
            ServiceError::NotPending => {
                AppError::Conflict(anyhow::anyhow!("Account deletion is not pending"))
            }
            ServiceError::RotationFailed => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid refresh token"))
            }
            ServiceError::Unauthorized(e) => AppError::Unauthorized(anyhow::anyhow!(e)),
            ServiceError::InvalidInput(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            ServiceError::Storage(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_flow_codes() {
        assert_eq!(DeviceFlowError::SlowDown.as_str(), "slow_down");
        assert_eq!(DeviceFlowError::InvalidGrant.as_str(), "invalid_grant");
        assert_eq!(
            DeviceFlowError::UnsupportedGrantType("password".into()).as_str(),
            "unsupported_grant_type"
        );
        assert_eq!(DeviceFlowError::InvalidClient.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(DeviceFlowError::ExpiredToken.status_code(), StatusCode::BAD_REQUEST);
        let malformed = DeviceFlowError::InvalidRequest("grant_type is required".into());
        assert_eq!(malformed.as_str(), "invalid_request");
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_service_error_status_mapping() {
        let conflict: AppError = ServiceError::AlreadyPending.into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let unauthorized: AppError = ServiceError::RotationFailed.into();
        assert_eq!(unauthorized.status_code(), StatusCode::UNAUTHORIZED);

        let missing: AppError = ServiceError::NotFound("Subject".into()).into();
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let storage: AppError = ServiceError::Storage(anyhow::anyhow!("down")).into();
        assert_eq!(storage.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
