//! Services layer for identity-service.
//!
//! Business logic for token issuance, device authorization, account
//! lifecycle and auditing. Persistence is reached through the repository
//! traits in [`crate::store`].

pub mod account;
pub mod audit;
pub mod device_auth;
pub mod error;
mod jwt;
pub mod maintenance;
pub mod metrics;
pub mod redis;
pub mod refresh_tokens;
pub mod session;

pub use account::{AccountLifecycleService, DeletionScheduled, SweepFailure, SweepReport};
pub use audit::{AuditLogService, AuditSink};
pub use device_auth::{
    DeviceAuthorizationService, DeviceCodeLookup, DeviceCodeResponse, DEVICE_CODE_GRANT_TYPE,
};
pub use error::{DeviceFlowError, ServiceError, TokenError};
pub use jwt::{AccessTokenClaims, IssuedCredentials, JwtService, TokenSubject};
pub use maintenance::{MaintenanceReport, MaintenanceRunner};
pub use redis::{InMemoryBlacklist, RedisService, TokenBlacklist};
pub use refresh_tokens::RefreshTokenStore;
pub use session::{IssueSource, SessionService, TokenResponse};
