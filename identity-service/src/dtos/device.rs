use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct DeviceCodeRequest {
    #[validate(length(min = 1, message = "client_id is required"))]
    pub client_id: String,
}

/// Token endpoint body. Which optional fields are required depends on
/// `grant_type`.
#[derive(Debug, Deserialize, Validate)]
pub struct TokenRequest {
    #[validate(length(min = 1, message = "grant_type is required"))]
    pub grant_type: String,
    pub device_code: Option<String>,
    pub client_id: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UserCodeRequest {
    #[validate(length(min = 8, max = 16, message = "user_code must be 8 characters"))]
    pub user_code: String,
}
