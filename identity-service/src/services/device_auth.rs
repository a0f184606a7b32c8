//! OAuth 2.0 Device Authorization Grant (RFC 8628).
//!
//! A CLI asks for a code pair, shows the user code, and polls with the
//! device code while the user approves or denies in a browser. The only
//! path that yields tokens is a poll that wins the `authorized -> used`
//! compare-and-swap, so a code pays out at most once.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::DeviceFlowConfig;
use crate::models::{AuditEventType, DeviceCode, DeviceCodeStatus, DeviceMetadata, RequestOrigin};
use crate::services::audit::AuditLogService;
use crate::services::error::{DeviceFlowError, ServiceError};
use crate::services::metrics;
use crate::services::session::{IssueSource, SessionService, TokenResponse};
use crate::store::DeviceCodeRepository;

/// Grant type URN sent by polling clients.
pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// No 0/O, 1/I or L.
const USER_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const USER_CODE_LENGTH: usize = 8;
const DEVICE_CODE_BYTES: usize = 32;
const MAX_USER_CODE_ATTEMPTS: usize = 5;

/// Response to a device code request.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// What the verification page shows before the user decides.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCodeLookup {
    pub user_code: String,
    pub client_id: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

/// Random user code, `XXXX-XXXX`.
pub fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let chars: String = (0..USER_CODE_LENGTH)
        .map(|_| USER_CODE_ALPHABET[rng.gen_range(0..USER_CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", &chars[..4], &chars[4..])
}

/// Canonical `XXXX-XXXX` form of user input, tolerating case, hyphens and
/// whitespace. `None` if it cannot be a user code.
pub fn normalize_user_code(input: &str) -> Option<String> {
    let chars: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if chars.len() != USER_CODE_LENGTH || !chars.bytes().all(|b| USER_CODE_ALPHABET.contains(&b)) {
        return None;
    }
    Some(format!("{}-{}", &chars[..4], &chars[4..]))
}

fn generate_device_code() -> String {
    let mut bytes = [0u8; DEVICE_CODE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct DeviceAuthorizationService {
    repo: Arc<dyn DeviceCodeRepository>,
    sessions: SessionService,
    audit: AuditLogService,
    clock: Arc<dyn Clock>,
    allowed_clients: HashSet<String>,
    verification_uri: String,
    code_lifetime: Duration,
    poll_interval: Duration,
}

impl DeviceAuthorizationService {
    pub fn new(
        config: &DeviceFlowConfig,
        repo: Arc<dyn DeviceCodeRepository>,
        sessions: SessionService,
        audit: AuditLogService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            sessions,
            audit,
            clock,
            allowed_clients: config.allowed_client_ids.iter().cloned().collect(),
            verification_uri: config.verification_uri.clone(),
            code_lifetime: Duration::seconds(config.code_expiry_seconds),
            poll_interval: Duration::seconds(config.poll_interval_seconds),
        }
    }

    pub fn is_allowed_client(&self, client_id: &str) -> bool {
        self.allowed_clients.contains(client_id)
    }

    /// Issue a device code and user code pair for an allow-listed client.
    pub async fn request_code(
        &self,
        client_id: &str,
        origin: &RequestOrigin,
    ) -> Result<DeviceCodeResponse, DeviceFlowError> {
        if !self.is_allowed_client(client_id) {
            tracing::warn!(client_id, "Device code requested by unknown client");
            return Err(DeviceFlowError::ClientUnknown(client_id.to_string()));
        }

        let now = self.clock.now();
        for _ in 0..MAX_USER_CODE_ATTEMPTS {
            let code = DeviceCode::new(
                generate_device_code(),
                generate_user_code(),
                client_id,
                now,
                self.code_lifetime,
                self.poll_interval,
            );

            if !self.repo.insert(&code).await? {
                tracing::debug!("User code collision, retrying");
                continue;
            }

            tracing::info!(client_id, user_code = %code.user_code, "Issued device code");
            self.audit
                .record_system(
                    AuditEventType::DeviceCodeIssued,
                    json!({
                        "client_id": client_id,
                        "user_code": code.user_code,
                        "ip_address": origin.ip_address,
                    }),
                )
                .await;

            let verification_uri_complete = format!(
                "{}?user_code={}",
                self.verification_uri,
                urlencoding::encode(&code.user_code)
            );
            return Ok(DeviceCodeResponse {
                expires_in: code.expires_in(now),
                interval: code.interval_seconds,
                device_code: code.device_code,
                user_code: code.user_code,
                verification_uri: self.verification_uri.clone(),
                verification_uri_complete,
            });
        }

        Err(DeviceFlowError::Internal(anyhow::anyhow!(
            "Could not allocate a unique user code after {} attempts",
            MAX_USER_CODE_ATTEMPTS
        )))
    }

    /// Token endpoint poll. Returns tokens at most once per device code.
    pub async fn poll(
        &self,
        device_code: &str,
        client_id: &str,
        origin: &RequestOrigin,
    ) -> Result<TokenResponse, DeviceFlowError> {
        let result = self.poll_inner(device_code, client_id, origin).await;
        match &result {
            Ok(_) => metrics::record_device_poll("issued"),
            Err(e) => metrics::record_device_poll(e.as_str()),
        }
        result
    }

    async fn poll_inner(
        &self,
        device_code: &str,
        client_id: &str,
        origin: &RequestOrigin,
    ) -> Result<TokenResponse, DeviceFlowError> {
        if !self.is_allowed_client(client_id) {
            return Err(DeviceFlowError::InvalidClient);
        }

        let now = self.clock.now();
        // Advances last_polled_at even when this poll is rejected below.
        let record = self
            .repo
            .record_poll(device_code, now)
            .await?
            .ok_or(DeviceFlowError::InvalidGrant)?;

        if record.client_id != client_id {
            tracing::warn!(client_id, "Device code polled by a different client");
            return Err(DeviceFlowError::InvalidClient);
        }

        if record.polled_too_soon(now) {
            return Err(DeviceFlowError::SlowDown);
        }

        if record.is_expired(now) {
            return Err(DeviceFlowError::ExpiredToken);
        }

        match record.status {
            DeviceCodeStatus::Pending => Err(DeviceFlowError::AuthorizationPending),
            DeviceCodeStatus::Denied => Err(DeviceFlowError::AccessDenied),
            DeviceCodeStatus::Used => {
                tracing::warn!(user_code = %record.user_code, "Replayed device code poll");
                Err(DeviceFlowError::InvalidGrant)
            }
            DeviceCodeStatus::Authorized => self.redeem(&record, origin, now).await,
        }
    }

    async fn redeem(
        &self,
        record: &DeviceCode,
        origin: &RequestOrigin,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, DeviceFlowError> {
        let subject_id = record.subject_id.ok_or_else(|| {
            DeviceFlowError::Internal(anyhow::anyhow!("Authorized device code has no subject"))
        })?;

        let won = self
            .repo
            .transition(
                &record.device_code,
                DeviceCodeStatus::Authorized,
                DeviceCodeStatus::Used,
                None,
                now,
            )
            .await?;
        if !won {
            tracing::warn!(user_code = %record.user_code, "Lost device code redemption race");
            return Err(DeviceFlowError::InvalidGrant);
        }

        let device = DeviceMetadata {
            device_name: None,
            client_id: Some(record.client_id.clone()),
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
        };
        let tokens = self
            .sessions
            .issue_for_subject(subject_id, device, IssueSource::Device)
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) => DeviceFlowError::InvalidGrant,
                other => {
                    // The code is already Used; the client must start a new flow.
                    tracing::error!(user_code = %record.user_code, error = %other, "Device code consumed but token issuance failed");
                    DeviceFlowError::Internal(anyhow::anyhow!(other))
                }
            })?;

        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::DeviceTokensIssued,
                origin,
                json!({ "client_id": record.client_id }),
            )
            .await;

        Ok(tokens)
    }

    async fn pending_by_user_code(&self, user_code: &str) -> Result<DeviceCode, DeviceFlowError> {
        let normalized = normalize_user_code(user_code).ok_or(DeviceFlowError::NotFound)?;
        let record = self
            .repo
            .find_by_user_code(&normalized)
            .await?
            .ok_or(DeviceFlowError::NotFound)?;

        if record.is_expired(self.clock.now()) {
            return Err(DeviceFlowError::Expired);
        }
        if record.status != DeviceCodeStatus::Pending {
            return Err(DeviceFlowError::AlreadyProcessed);
        }
        Ok(record)
    }

    /// Move a pending code to `to`, reporting why if the swap fails.
    async fn decide(
        &self,
        record: &DeviceCode,
        to: DeviceCodeStatus,
        subject_id: Option<Uuid>,
    ) -> Result<(), DeviceFlowError> {
        let now = self.clock.now();
        let swapped = self
            .repo
            .transition(&record.device_code, DeviceCodeStatus::Pending, to, subject_id, now)
            .await?;
        if swapped {
            return Ok(());
        }

        if record.is_expired(now) {
            Err(DeviceFlowError::Expired)
        } else {
            Err(DeviceFlowError::AlreadyProcessed)
        }
    }

    /// Approve a pending code on behalf of `subject_id`.
    pub async fn authorize(
        &self,
        user_code: &str,
        subject_id: Uuid,
        origin: &RequestOrigin,
    ) -> Result<(), DeviceFlowError> {
        let record = self.pending_by_user_code(user_code).await?;
        self.decide(&record, DeviceCodeStatus::Authorized, Some(subject_id))
            .await?;

        tracing::info!(subject_id = %subject_id, user_code = %record.user_code, "Device authorized");
        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::DeviceAuthorized,
                origin,
                json!({ "client_id": record.client_id, "user_code": record.user_code }),
            )
            .await;
        Ok(())
    }

    /// Reject a pending code.
    pub async fn deny(
        &self,
        user_code: &str,
        subject_id: Uuid,
        origin: &RequestOrigin,
    ) -> Result<(), DeviceFlowError> {
        let record = self.pending_by_user_code(user_code).await?;
        self.decide(&record, DeviceCodeStatus::Denied, None).await?;

        tracing::info!(subject_id = %subject_id, user_code = %record.user_code, "Device denied");
        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::DeviceDenied,
                origin,
                json!({ "client_id": record.client_id, "user_code": record.user_code }),
            )
            .await;
        Ok(())
    }

    /// Read-only view of a pending code for the verification page.
    pub async fn lookup(&self, user_code: &str) -> Result<DeviceCodeLookup, DeviceFlowError> {
        let record = self.pending_by_user_code(user_code).await?;
        Ok(DeviceCodeLookup {
            expires_in: record.expires_in(self.clock.now()),
            user_code: record.user_code,
            client_id: record.client_id,
            expires_at: record.expires_at,
        })
    }

    pub async fn cleanup_expired(&self) -> Result<u64, DeviceFlowError> {
        Ok(self.repo.delete_expired(self.clock.now()).await?)
    }
}
