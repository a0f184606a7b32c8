//! Audit trail for identity-affecting events.
//!
//! Writing an event never fails the operation that triggered it: storage
//! errors are logged and swallowed. Events are written in call order, so
//! per-subject ordering follows the order of the triggering operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{AuditEvent, AuditEventType, RequestOrigin};
use crate::services::error::ServiceError;
use crate::store::AuditRepository;

/// Where the core sends audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

#[derive(Clone)]
pub struct AuditLogService {
    repo: Arc<dyn AuditRepository>,
    clock: Arc<dyn Clock>,
}

impl AuditLogService {
    pub fn new(repo: Arc<dyn AuditRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Record an event for `subject_id` stamped with the current time.
    pub async fn record_for_subject(
        &self,
        subject_id: Uuid,
        event_type: AuditEventType,
        origin: &RequestOrigin,
        event_data: serde_json::Value,
    ) {
        let event =
            AuditEvent::subject_action(subject_id, event_type, origin, event_data, self.clock.now());
        self.record(event).await;
    }

    pub async fn record_system(&self, event_type: AuditEventType, event_data: serde_json::Value) {
        let event = AuditEvent::system_action(event_type, event_data, self.clock.now());
        self.record(event).await;
    }

    pub async fn recent_for_subject(
        &self,
        subject_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, ServiceError> {
        self.repo
            .find_by_subject(subject_id, limit)
            .await
            .map_err(ServiceError::storage)
    }

    pub async fn by_type(
        &self,
        event_type: AuditEventType,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, ServiceError> {
        self.repo
            .find_by_type(event_type, limit)
            .await
            .map_err(ServiceError::storage)
    }

    /// Failed sign-ins in the trailing `window`, optionally for one subject.
    pub async fn failed_sign_ins_since(
        &self,
        subject_id: Option<Uuid>,
        window: Duration,
    ) -> Result<i64, ServiceError> {
        let since = self.clock.now() - window;
        self.repo
            .count_since(AuditEventType::SignInFailed, subject_id, since)
            .await
            .map_err(ServiceError::storage)
    }

    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let deleted = self
            .repo
            .delete_older_than(cutoff)
            .await
            .map_err(ServiceError::storage)?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Purged audit events past retention");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl AuditSink for AuditLogService {
    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.repo.insert(&event).await {
            tracing::error!(
                error = %e,
                event_type = event.event_type.as_str(),
                subject_id = ?event.subject_id,
                "Failed to write audit event"
            );
        }
    }
}
