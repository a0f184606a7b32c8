use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Client/device details recorded alongside a refresh token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_name: Option<String>,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceMetadata {
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }
}

/// Refresh token record. Only the SHA-256 hash of the secret is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token_id: Uuid,

    /// Subject this token belongs to
    pub subject_id: Uuid,

    /// SHA-256 hash of the refresh secret
    pub token_hash: String,

    pub device: DeviceMetadata,

    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    /// Set on rotation, logout or revoke-all
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    /// Create a new refresh token record for a plaintext secret.
    pub fn new(
        subject_id: Uuid,
        secret: &str,
        device: DeviceMetadata,
        now: DateTime<Utc>,
        validity: Duration,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            subject_id,
            token_hash: Self::hash_token(secret),
            device,
            expires_at: now + validity,
            created_at: now,
            revoked_at: None,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Valid iff not expired and not revoked.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && !self.is_revoked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_creation() {
        let now = Utc::now();
        let subject = Uuid::new_v4();
        let token = RefreshToken::new(subject, "token_abc", DeviceMetadata::default(), now, Duration::days(7));

        assert_eq!(token.subject_id, subject);
        assert_ne!(token.token_hash, "token_abc");
        assert_eq!(token.token_hash, RefreshToken::hash_token("token_abc"));
        assert_eq!(token.expires_at, now + Duration::days(7));
        assert!(token.is_valid(now));
    }

    #[test]
    fn test_refresh_token_expiry() {
        let now = Utc::now();
        let token = RefreshToken::new(Uuid::new_v4(), "token_abc", DeviceMetadata::default(), now, Duration::days(7));

        assert!(token.is_valid(now + Duration::days(7) - Duration::seconds(1)));
        assert!(token.is_expired(now + Duration::days(7)));
        assert!(!token.is_valid(now + Duration::days(7)));
    }

    #[test]
    fn test_refresh_token_revocation() {
        let now = Utc::now();
        let mut token = RefreshToken::new(Uuid::new_v4(), "token_abc", DeviceMetadata::default(), now, Duration::days(7));

        token.revoked_at = Some(now);
        assert!(!token.is_valid(now));
    }
}
