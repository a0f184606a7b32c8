//! Storage contracts for the identity core.
//!
//! Every operation that must be atomic (rotation, device code status flips,
//! deletion scheduling, purge) is a single repository call so that each
//! backend can implement it as one statement or one transaction.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_pool, run_migrations, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{
    AuditEvent, AuditEventType, DeletionSchedule, DeviceCode, DeviceCodeStatus,
    HouseholdSnapshot, IdentityLink, PurgeOutcome, PurgePlan, RefreshToken, ScheduleOutcome,
    Subject,
};

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn insert(&self, token: &RefreshToken) -> Result<(), anyhow::Error>;

    /// Look up by hash regardless of expiry or revocation.
    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, anyhow::Error>;

    /// Mark revoked; already-revoked tokens keep their original timestamp.
    /// Returns false if no token has this hash.
    async fn revoke_by_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error>;

    /// Revoke every valid token of a subject; returns how many were revoked.
    async fn revoke_all_for_subject(
        &self,
        subject_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, anyhow::Error>;

    /// Atomically revoke the token with `old_hash` (which must be valid and
    /// owned by `subject_id`) and insert `replacement`. Returns false, with no
    /// change, if the old token is not valid.
    async fn rotate(
        &self,
        old_hash: &str,
        subject_id: Uuid,
        replacement: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error>;

    /// Delete tokens past their expiry.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait DeviceCodeRepository: Send + Sync {
    /// Insert a new code; returns false if the user code is already taken.
    async fn insert(&self, code: &DeviceCode) -> Result<bool, anyhow::Error>;

    async fn find_by_device_code(&self, device_code: &str) -> Result<Option<DeviceCode>, anyhow::Error>;

    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<DeviceCode>, anyhow::Error>;

    /// Set `last_polled_at = now` and return the record as it was before the
    /// update. Concurrent pollers each observe the previous poller's time.
    async fn record_poll(
        &self,
        device_code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceCode>, anyhow::Error>;

    /// Compare-and-swap the status of an unexpired code. `subject_id`, when
    /// given, is bound in the same write. Returns false if the current status
    /// is not `from` or the code has expired.
    async fn transition(
        &self,
        device_code: &str,
        from: DeviceCodeStatus,
        to: DeviceCodeStatus,
        subject_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_subject(&self, subject_id: Uuid) -> Result<Option<Subject>, anyhow::Error>;

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<Subject>, anyhow::Error>;

    async fn find_subject_by_identity(
        &self,
        provider_code: &str,
        provider_subject: &str,
    ) -> Result<Option<Subject>, anyhow::Error>;

    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error>;

    async fn insert_identity_link(&self, link: &IdentityLink) -> Result<(), anyhow::Error>;

    async fn find_household(&self, household_id: Uuid) -> Result<Option<HouseholdSnapshot>, anyhow::Error>;

    /// Flip an active subject to pending deletion and apply the ownership
    /// transfer, all or nothing.
    async fn schedule_deletion(&self, schedule: &DeletionSchedule) -> Result<ScheduleOutcome, anyhow::Error>;

    /// Flip a pending subject back to active; false if it was not pending.
    async fn cancel_deletion(&self, subject_id: Uuid) -> Result<bool, anyhow::Error>;

    /// Pending subjects whose grace period ended at or before `now`, oldest first.
    async fn find_due_for_deletion(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Subject>, anyhow::Error>;

    /// Run every step of the plan in one transaction. Any failure rolls the
    /// whole subject back.
    async fn purge_subject(&self, plan: &PurgePlan) -> Result<PurgeOutcome, anyhow::Error>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn insert(&self, event: &AuditEvent) -> Result<(), anyhow::Error>;

    async fn find_by_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error>;

    async fn find_by_type(&self, event_type: AuditEventType, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error>;

    async fn count_since(
        &self,
        event_type: AuditEventType,
        subject_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error>;
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

/// The four repositories plus a health probe, as trait objects.
#[derive(Clone)]
pub struct Stores {
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub device_codes: Arc<dyn DeviceCodeRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub audit: Arc<dyn AuditRepository>,
    pub health: Arc<dyn HealthCheck>,
}

impl Stores {
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            refresh_tokens: store.clone(),
            device_codes: store.clone(),
            accounts: store.clone(),
            audit: store.clone(),
            health: store,
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            refresh_tokens: store.clone(),
            device_codes: store.clone(),
            accounts: store.clone(),
            audit: store.clone(),
            health: store,
        }
    }
}
