use axum::{
    extract::{FromRequest, Request},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::dtos::ErrorResponse;
use crate::services::DeviceFlowError;

fn rejection(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn validated<T: Validate>(value: T) -> Result<T, Response> {
    value.validate().map_err(|e| {
        rejection(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Validation error: {}", e),
        )
    })?;
    Ok(value)
}

pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
            rejection(StatusCode::BAD_REQUEST, format!("Json parse error: {}", e))
        })?;

        Ok(ValidatedJson(validated(value)?))
    }
}

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Form body when the content type says so, JSON otherwise.
async fn parse_payload<T, S>(req: Request, state: &S) -> Result<T, String>
where
    T: DeserializeOwned + 'static,
    S: Send + Sync,
{
    if is_form(&req) {
        let Form(value) = Form::<T>::from_request(req, state)
            .await
            .map_err(|e| format!("Form parse error: {}", e))?;
        Ok(value)
    } else {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| format!("Json parse error: {}", e))?;
        Ok(value)
    }
}

/// Accepts `application/x-www-form-urlencoded` or JSON, then validates.
pub struct ValidatedPayload<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedPayload<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let value: T = parse_payload(req, state)
            .await
            .map_err(|e| rejection(StatusCode::BAD_REQUEST, e))?;

        Ok(ValidatedPayload(validated(value)?))
    }
}

/// Same parsing as [`ValidatedPayload`] for the OAuth endpoints, which must
/// reject with an RFC 6749 `invalid_request` body instead.
pub struct OAuthPayload<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for OAuthPayload<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = DeviceFlowError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let value: T = parse_payload(req, state)
            .await
            .map_err(DeviceFlowError::InvalidRequest)?;
        value
            .validate()
            .map_err(|e| DeviceFlowError::InvalidRequest(e.to_string()))?;
        Ok(OAuthPayload(value))
    }
}
