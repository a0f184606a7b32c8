//! RFC 8628 device code record and its status machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Status of a device code.
///
/// Legal transitions: `Pending -> Authorized`, `Pending -> Denied`,
/// `Authorized -> Used`. Expiry is not a status; it is checked lazily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCodeStatus {
    Pending,
    Authorized,
    Denied,
    Used,
}

impl DeviceCodeStatus {
    const TRANSITIONS: &'static [(DeviceCodeStatus, DeviceCodeStatus)] = &[
        (DeviceCodeStatus::Pending, DeviceCodeStatus::Authorized),
        (DeviceCodeStatus::Pending, DeviceCodeStatus::Denied),
        (DeviceCodeStatus::Authorized, DeviceCodeStatus::Used),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCodeStatus::Pending => "pending",
            DeviceCodeStatus::Authorized => "authorized",
            DeviceCodeStatus::Denied => "denied",
            DeviceCodeStatus::Used => "used",
        }
    }

    pub fn can_transition_to(self, next: DeviceCodeStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceCodeStatus::Denied | DeviceCodeStatus::Used)
    }
}

impl FromStr for DeviceCodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeviceCodeStatus::Pending),
            "authorized" => Ok(DeviceCodeStatus::Authorized),
            "denied" => Ok(DeviceCodeStatus::Denied),
            "used" => Ok(DeviceCodeStatus::Used),
            other => Err(format!("Unknown device code status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCode {
    /// Long random polling credential; never shown to a human.
    pub device_code: String,
    /// Short human code, `XXXX-XXXX`.
    pub user_code: String,
    pub client_id: String,
    pub status: DeviceCodeStatus,
    /// Bound on authorize.
    pub subject_id: Option<Uuid>,
    pub interval_seconds: i64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeviceCode {
    pub fn new(
        device_code: String,
        user_code: String,
        client_id: impl Into<String>,
        now: DateTime<Utc>,
        lifetime: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            device_code,
            user_code,
            client_id: client_id.into(),
            status: DeviceCodeStatus::Pending,
            subject_id: None,
            interval_seconds: interval.num_seconds(),
            last_polled_at: None,
            expires_at: now + lifetime,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether a poll at `now` comes sooner than `interval` after the
    /// previous poll.
    pub fn polled_too_soon(&self, now: DateTime<Utc>) -> bool {
        match self.last_polled_at {
            Some(last) => now < last + Duration::seconds(self.interval_seconds),
            None => false,
        }
    }

    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}
