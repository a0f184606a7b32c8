//! Token pair issuance and everything that happens to a session afterwards:
//! refresh rotation, bearer authentication, logout and revoke-all.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    AuditEventType, DeviceMetadata, IdentityLink, RequestOrigin, Subject, VerifiedIdentity,
};
use crate::services::audit::AuditLogService;
use crate::services::error::{ServiceError, TokenError};
use crate::services::jwt::{AccessTokenClaims, JwtService, TokenSubject};
use crate::services::metrics;
use crate::services::redis::TokenBlacklist;
use crate::services::refresh_tokens::RefreshTokenStore;
use crate::store::AccountRepository;

/// Token response returned to client
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Which path minted a token pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSource {
    SignIn,
    Refresh,
    Device,
}

impl IssueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSource::SignIn => "sign_in",
            IssueSource::Refresh => "refresh",
            IssueSource::Device => "device",
        }
    }
}

#[derive(Clone)]
pub struct SessionService {
    accounts: Arc<dyn AccountRepository>,
    jwt: JwtService,
    refresh_tokens: RefreshTokenStore,
    blacklist: Arc<dyn TokenBlacklist>,
    audit: AuditLogService,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        jwt: JwtService,
        refresh_tokens: RefreshTokenStore,
        blacklist: Arc<dyn TokenBlacklist>,
        audit: AuditLogService,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            jwt,
            refresh_tokens,
            blacklist,
            audit,
            clock,
        }
    }

    pub fn refresh_tokens(&self) -> &RefreshTokenStore {
        &self.refresh_tokens
    }

    /// Claims input for `subject`, with household and role read from the
    /// household aggregate.
    async fn token_subject(&self, subject: &Subject) -> Result<TokenSubject, ServiceError> {
        let membership = match subject.household_id {
            Some(household_id) => self
                .accounts
                .find_household(household_id)
                .await
                .map_err(ServiceError::storage)?
                .and_then(|snapshot| snapshot.member(subject.subject_id).cloned()),
            None => None,
        };

        Ok(TokenSubject {
            subject_id: subject.subject_id,
            email: subject.email.clone(),
            household_id: membership.as_ref().map(|m| m.household_id),
            role: membership.map(|m| m.role),
        })
    }

    /// Mint and persist a token pair for an existing subject.
    pub async fn issue_for_subject(
        &self,
        subject_id: Uuid,
        device: DeviceMetadata,
        source: IssueSource,
    ) -> Result<TokenResponse, ServiceError> {
        let subject = self
            .accounts
            .find_subject(subject_id)
            .await
            .map_err(ServiceError::storage)?
            .ok_or_else(|| ServiceError::NotFound("Subject".to_string()))?;

        let token_subject = self.token_subject(&subject).await?;
        let issued = self.jwt.issue(&token_subject)?;
        self.refresh_tokens
            .store(subject.subject_id, &issued.refresh_secret, device)
            .await?;

        metrics::record_tokens_issued(source.as_str());
        tracing::info!(subject_id = %subject.subject_id, source = source.as_str(), "Issued token pair");

        Ok(TokenResponse {
            access_token: issued.access_token,
            refresh_token: issued.refresh_secret,
            token_type: issued.token_type.to_string(),
            expires_in: issued.expires_in,
        })
    }

    /// Sign in with an identity already verified by the OAuth collaborator.
    ///
    /// Resolves the subject by identity link, then by email (linking the
    /// provider), else creates it. Subjects pending deletion may sign in.
    pub async fn sign_in_with_provider(
        &self,
        identity: VerifiedIdentity,
        device: DeviceMetadata,
        origin: &RequestOrigin,
    ) -> Result<TokenResponse, ServiceError> {
        let email = identity.email.trim().to_lowercase();
        if identity.provider.is_empty() || identity.provider_subject.is_empty() || !email.contains('@') {
            self.audit
                .record_system(
                    AuditEventType::SignInFailed,
                    json!({ "provider": identity.provider, "reason": "incomplete_identity" }),
                )
                .await;
            return Err(ServiceError::InvalidInput(
                "Verified identity requires provider, provider subject and email".to_string(),
            ));
        }

        let now = self.clock.now();
        let accounts = &self.accounts;

        let subject = match accounts
            .find_subject_by_identity(&identity.provider, &identity.provider_subject)
            .await
            .map_err(ServiceError::storage)?
        {
            Some(subject) => subject,
            None => {
                let subject = match accounts
                    .find_subject_by_email(&email)
                    .await
                    .map_err(ServiceError::storage)?
                {
                    Some(existing) => existing,
                    None => {
                        let created = Subject::new(email.clone(), identity.display_name.clone(), now);
                        accounts
                            .insert_subject(&created)
                            .await
                            .map_err(ServiceError::storage)?;
                        self.audit
                            .record_for_subject(
                                created.subject_id,
                                AuditEventType::SubjectCreated,
                                origin,
                                json!({ "provider": identity.provider }),
                            )
                            .await;
                        created
                    }
                };

                let link = IdentityLink::new(
                    subject.subject_id,
                    identity.provider.clone(),
                    identity.provider_subject.clone(),
                    now,
                );
                accounts
                    .insert_identity_link(&link)
                    .await
                    .map_err(ServiceError::storage)?;
                subject
            }
        };

        let tokens = self
            .issue_for_subject(subject.subject_id, device, IssueSource::SignIn)
            .await?;

        self.audit
            .record_for_subject(
                subject.subject_id,
                AuditEventType::SignIn,
                origin,
                json!({
                    "provider": identity.provider,
                    "pending_deletion": subject.is_pending_deletion(),
                }),
            )
            .await;

        Ok(tokens)
    }

    /// Exchange a refresh secret for a new pair, rotating the secret.
    ///
    /// Presenting a secret that was already rotated out or revoked is
    /// recorded as reuse and rejected.
    pub async fn refresh(
        &self,
        secret: &str,
        device: DeviceMetadata,
        origin: &RequestOrigin,
    ) -> Result<TokenResponse, ServiceError> {
        let now = self.clock.now();

        let Some(record) = self.refresh_tokens.lookup(secret).await? else {
            metrics::record_refresh_outcome("unknown");
            return Err(ServiceError::Unauthorized("Invalid refresh token".to_string()));
        };

        if record.is_revoked() {
            self.report_reuse(record.subject_id, record.token_id, origin).await;
            return Err(ServiceError::Unauthorized("Invalid refresh token".to_string()));
        }

        if record.is_expired(now) {
            metrics::record_refresh_outcome("expired");
            self.audit
                .record_for_subject(
                    record.subject_id,
                    AuditEventType::AccessTokenRejected,
                    origin,
                    json!({ "token_id": record.token_id, "reason": "expired" }),
                )
                .await;
            return Err(ServiceError::Unauthorized("Refresh token expired".to_string()));
        }

        let subject = self
            .accounts
            .find_subject(record.subject_id)
            .await
            .map_err(ServiceError::storage)?
            .ok_or_else(|| ServiceError::Unauthorized("Unknown subject".to_string()))?;

        let device = DeviceMetadata {
            device_name: device.device_name.or(record.device.device_name.clone()),
            client_id: device.client_id.or(record.device.client_id.clone()),
            ip_address: origin.ip_address.clone().or(device.ip_address),
            user_agent: origin.user_agent.clone().or(device.user_agent),
        };

        let new_secret = match self
            .refresh_tokens
            .rotate(secret, subject.subject_id, device)
            .await
        {
            Ok(new_secret) => new_secret,
            Err(ServiceError::RotationFailed) => {
                // Lost a race with a concurrent rotation of the same secret.
                self.report_reuse(record.subject_id, record.token_id, origin).await;
                return Err(ServiceError::RotationFailed);
            }
            Err(e) => {
                metrics::record_refresh_outcome("error");
                tracing::error!(subject_id = %subject.subject_id, error = %e, "Refresh token rotation failed");
                return Err(e);
            }
        };

        let token_subject = self.token_subject(&subject).await?;
        let (access_token, _) = self.jwt.issue_access_token(&token_subject)?;

        metrics::record_refresh_outcome("rotated");
        metrics::record_tokens_issued(IssueSource::Refresh.as_str());
        self.audit
            .record_for_subject(
                subject.subject_id,
                AuditEventType::TokenRefreshed,
                origin,
                json!({ "previous_token_id": record.token_id }),
            )
            .await;

        Ok(TokenResponse {
            access_token,
            refresh_token: new_secret,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }

    async fn report_reuse(&self, subject_id: Uuid, token_id: Uuid, origin: &RequestOrigin) {
        metrics::record_refresh_outcome("reuse");
        tracing::warn!(subject_id = %subject_id, token_id = %token_id, "Refresh token reuse detected");
        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::RefreshTokenReuse,
                origin,
                json!({ "token_id": token_id }),
            )
            .await;
    }

    /// Verify a bearer token and check it against the blacklist.
    ///
    /// A blacklist outage rejects the token.
    pub async fn authenticate(
        &self,
        token: &str,
        origin: &RequestOrigin,
    ) -> Result<AccessTokenClaims, ServiceError> {
        let claims = match self.jwt.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Access token verification failed");
                if let TokenError::Expired {
                    subject: Some(subject_id),
                } = e
                {
                    self.audit
                        .record_for_subject(
                            subject_id,
                            AuditEventType::AccessTokenRejected,
                            origin,
                            json!({ "reason": "expired" }),
                        )
                        .await;
                }
                return Err(ServiceError::from(e));
            }
        };

        let blacklisted = self.blacklist.is_blacklisted(&claims.jti).await.map_err(|e| {
            tracing::error!(error = %e, "Blacklist lookup failed; rejecting token");
            ServiceError::Unauthorized("Token could not be verified".to_string())
        })?;

        if blacklisted {
            if let Ok(subject_id) = claims.subject_id() {
                self.audit
                    .record_for_subject(
                        subject_id,
                        AuditEventType::AccessTokenRejected,
                        origin,
                        json!({ "jti": claims.jti, "reason": "blacklisted" }),
                    )
                    .await;
            }
            tracing::warn!(jti = %claims.jti, "Rejected blacklisted access token");
            return Err(ServiceError::Unauthorized("Token has been revoked".to_string()));
        }

        Ok(claims)
    }

    async fn blacklist_access_token(&self, claims: &AccessTokenClaims) -> Result<(), ServiceError> {
        let ttl = self.jwt.remaining_lifetime_seconds(claims);
        self.blacklist
            .blacklist_token(&claims.jti, ttl)
            .await
            .map_err(|e| {
                tracing::error!(jti = %claims.jti, error = %e, "Failed to blacklist access token");
                ServiceError::Internal(e)
            })
    }

    /// Revoke one refresh token of the caller. Unknown secrets and secrets of
    /// other subjects are ignored; returns whether a token was revoked.
    pub async fn revoke(
        &self,
        claims: &AccessTokenClaims,
        refresh_secret: &str,
        origin: &RequestOrigin,
    ) -> Result<bool, ServiceError> {
        let subject_id = claims.subject_id()?;
        let owned = self
            .refresh_tokens
            .lookup(refresh_secret)
            .await?
            .map(|t| t.subject_id == subject_id)
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }

        self.refresh_tokens.revoke(refresh_secret).await?;
        self.audit
            .record_for_subject(subject_id, AuditEventType::TokenRevoked, origin, json!({}))
            .await;
        Ok(true)
    }

    /// Revoke the session's refresh token, if given, and blacklist the
    /// current access token for the rest of its lifetime.
    pub async fn logout(
        &self,
        claims: &AccessTokenClaims,
        refresh_secret: Option<&str>,
        origin: &RequestOrigin,
    ) -> Result<(), ServiceError> {
        if let Some(secret) = refresh_secret {
            self.revoke(claims, secret, origin).await?;
        }
        self.blacklist_access_token(claims).await?;
        tracing::info!(sub = %claims.sub, "Logged out");
        Ok(())
    }

    /// Revoke every refresh token of the caller and blacklist the current
    /// access token. Returns the number of refresh tokens revoked.
    pub async fn revoke_all(
        &self,
        claims: &AccessTokenClaims,
        origin: &RequestOrigin,
    ) -> Result<u64, ServiceError> {
        let subject_id = claims.subject_id()?;
        let count = self.refresh_tokens.revoke_all(subject_id).await?;
        self.blacklist_access_token(claims).await?;
        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::AllTokensRevoked,
                origin,
                json!({ "count": count }),
            )
            .await;
        Ok(count)
    }
}
