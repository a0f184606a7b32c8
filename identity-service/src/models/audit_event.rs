//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SubjectCreated,
    SignIn,
    SignInFailed,
    AccessTokenRejected,
    TokenRefreshed,
    RefreshTokenReuse,
    TokenRevoked,
    AllTokensRevoked,
    DeviceCodeIssued,
    DeviceAuthorized,
    DeviceDenied,
    DeviceTokensIssued,
    DeletionRequested,
    DeletionCancelled,
    HouseholdOwnershipTransferred,
    AccountDeleted,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 16] = [
        AuditEventType::SubjectCreated,
        AuditEventType::SignIn,
        AuditEventType::SignInFailed,
        AuditEventType::AccessTokenRejected,
        AuditEventType::TokenRefreshed,
        AuditEventType::RefreshTokenReuse,
        AuditEventType::TokenRevoked,
        AuditEventType::AllTokensRevoked,
        AuditEventType::DeviceCodeIssued,
        AuditEventType::DeviceAuthorized,
        AuditEventType::DeviceDenied,
        AuditEventType::DeviceTokensIssued,
        AuditEventType::DeletionRequested,
        AuditEventType::DeletionCancelled,
        AuditEventType::HouseholdOwnershipTransferred,
        AuditEventType::AccountDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::SubjectCreated => "subject_created",
            AuditEventType::SignIn => "sign_in",
            AuditEventType::SignInFailed => "sign_in_failed",
            AuditEventType::AccessTokenRejected => "access_token_rejected",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::RefreshTokenReuse => "refresh_token_reuse",
            AuditEventType::TokenRevoked => "token_revoked",
            AuditEventType::AllTokensRevoked => "all_tokens_revoked",
            AuditEventType::DeviceCodeIssued => "device_code_issued",
            AuditEventType::DeviceAuthorized => "device_authorized",
            AuditEventType::DeviceDenied => "device_denied",
            AuditEventType::DeviceTokensIssued => "device_tokens_issued",
            AuditEventType::DeletionRequested => "deletion_requested",
            AuditEventType::DeletionCancelled => "deletion_cancelled",
            AuditEventType::HouseholdOwnershipTransferred => "household_ownership_transferred",
            AuditEventType::AccountDeleted => "account_deleted",
        }
    }
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown audit event type: {}", s))
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestOrigin {
    pub fn new(ip_address: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent,
        }
    }

    /// Origin for events raised by background jobs.
    pub fn system() -> Self {
        Self::default()
    }
}

/// Audit event entity. Append-only; the only mutation is anonymization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub subject_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub event_data: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl AuditEvent {
    /// Create a new audit event for a subject action.
    pub fn subject_action(
        subject_id: Uuid,
        event_type: AuditEventType,
        origin: &RequestOrigin,
        event_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subject_id: Some(subject_id),
            event_type,
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            event_data,
            created_utc: now,
        }
    }

    /// Create a system-level audit event (no subject).
    pub fn system_action(
        event_type: AuditEventType,
        event_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            subject_id: None,
            event_type,
            ip_address: None,
            user_agent: None,
            event_data,
            created_utc: now,
        }
    }

    /// Detach the event from its subject.
    pub fn anonymize(&mut self, now: DateTime<Utc>) {
        self.subject_id = None;
        let mut data = match self.event_data.take() {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("original".to_string(), other);
                map
            }
        };
        data.insert("anonymized".to_string(), serde_json::Value::Bool(true));
        data.insert(
            "anonymized_at".to_string(),
            serde_json::Value::String(now.to_rfc3339()),
        );
        self.event_data = serde_json::Value::Object(data);
    }

    pub fn is_anonymized(&self) -> bool {
        self.event_data
            .get("anonymized")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
