//! Account deletion with a grace period.
//!
//! A deletion request flips the subject to `pending_deletion` and, if the
//! subject owns a shared household, hands ownership to the next member in
//! the same write. Once the grace period has run out the sweep hard-deletes
//! each due subject in its own transaction.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{
    AuditEventType, DeletionSchedule, OwnershipTransfer, PurgePlan, PurgeStep, RequestOrigin,
    ScheduleOutcome, Subject,
};
use crate::services::audit::AuditLogService;
use crate::services::error::ServiceError;
use crate::services::metrics;
use crate::store::AccountRepository;

/// Subjects fetched per sweep query.
const SWEEP_BATCH_SIZE: i64 = 100;
/// Re-plans allowed when household ownership moves under a deletion request.
const MAX_SCHEDULE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct DeletionScheduled {
    pub scheduled_at: DateTime<Utc>,
    pub grace_period_days: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ownership_transferred_to: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub subject_id: Uuid,
    pub reason: String,
}

/// Result of one pass over due subjects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub purged: Vec<Uuid>,
    pub failed: Vec<SweepFailure>,
}

#[derive(Clone)]
pub struct AccountLifecycleService {
    accounts: Arc<dyn AccountRepository>,
    audit: AuditLogService,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
}

impl AccountLifecycleService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        audit: AuditLogService,
        clock: Arc<dyn Clock>,
        grace_period_days: i64,
    ) -> Self {
        Self {
            accounts,
            audit,
            clock,
            grace_period: Duration::days(grace_period_days),
        }
    }

    async fn load_subject(&self, subject_id: Uuid) -> Result<Subject, ServiceError> {
        self.accounts
            .find_subject(subject_id)
            .await
            .map_err(ServiceError::storage)?
            .ok_or_else(|| ServiceError::NotFound("Subject".to_string()))
    }

    /// Ownership handoff needed if `subject` owns a household that has other members.
    async fn plan_transfer(&self, subject: &Subject) -> Result<Option<OwnershipTransfer>, ServiceError> {
        let Some(household_id) = subject.household_id else {
            return Ok(None);
        };
        let Some(snapshot) = self
            .accounts
            .find_household(household_id)
            .await
            .map_err(ServiceError::storage)?
        else {
            return Ok(None);
        };

        if !snapshot.is_owned_by(subject.subject_id) {
            return Ok(None);
        }
        Ok(snapshot
            .successor_for(subject.subject_id)
            .map(|successor| OwnershipTransfer {
                household_id,
                from_subject_id: subject.subject_id,
                to_subject_id: successor.subject_id,
            }))
    }

    /// Schedule the subject for hard deletion after the grace period.
    pub async fn request_deletion(
        &self,
        subject_id: Uuid,
        origin: &RequestOrigin,
    ) -> Result<DeletionScheduled, ServiceError> {
        for _ in 0..MAX_SCHEDULE_ATTEMPTS {
            let subject = self.load_subject(subject_id).await?;
            if subject.is_pending_deletion() {
                return Err(ServiceError::AlreadyPending);
            }

            let ownership_transfer = self.plan_transfer(&subject).await?;
            let schedule = DeletionSchedule {
                subject_id,
                scheduled_at: self.clock.now() + self.grace_period,
                ownership_transfer,
            };

            match self
                .accounts
                .schedule_deletion(&schedule)
                .await
                .map_err(ServiceError::storage)?
            {
                ScheduleOutcome::Scheduled => {
                    self.after_scheduled(&schedule, origin).await;
                    return Ok(DeletionScheduled {
                        scheduled_at: schedule.scheduled_at,
                        grace_period_days: self.grace_period.num_days(),
                        ownership_transferred_to: schedule
                            .ownership_transfer
                            .map(|t| t.to_subject_id),
                    });
                }
                ScheduleOutcome::NotActive | ScheduleOutcome::OwnershipChanged => {
                    tracing::debug!(subject_id = %subject_id, "Deletion schedule raced, re-planning");
                }
            }
        }

        Err(ServiceError::Internal(anyhow::anyhow!(
            "Could not schedule deletion for {} after {} attempts",
            subject_id,
            MAX_SCHEDULE_ATTEMPTS
        )))
    }

    async fn after_scheduled(&self, schedule: &DeletionSchedule, origin: &RequestOrigin) {
        tracing::info!(
            subject_id = %schedule.subject_id,
            scheduled_at = %schedule.scheduled_at,
            "Account deletion scheduled"
        );
        self.audit
            .record_for_subject(
                schedule.subject_id,
                AuditEventType::DeletionRequested,
                origin,
                json!({
                    "scheduled_at": schedule.scheduled_at.to_rfc3339(),
                    "grace_period_days": self.grace_period.num_days(),
                }),
            )
            .await;

        if let Some(transfer) = &schedule.ownership_transfer {
            tracing::info!(
                household_id = %transfer.household_id,
                to = %transfer.to_subject_id,
                "Household ownership transferred"
            );
            self.audit
                .record_for_subject(
                    transfer.to_subject_id,
                    AuditEventType::HouseholdOwnershipTransferred,
                    origin,
                    json!({ "household_id": transfer.household_id, "reason": "deletion_requested" }),
                )
                .await;
        }
    }

    /// Return a pending subject to active. Ownership handed off at request
    /// time stays with the new owner.
    pub async fn cancel_deletion(
        &self,
        subject_id: Uuid,
        origin: &RequestOrigin,
    ) -> Result<(), ServiceError> {
        let subject = self.load_subject(subject_id).await?;
        if !subject.is_pending_deletion() {
            return Err(ServiceError::NotPending);
        }

        let cancelled = self
            .accounts
            .cancel_deletion(subject_id)
            .await
            .map_err(ServiceError::storage)?;
        if !cancelled {
            return Err(ServiceError::NotPending);
        }

        tracing::info!(subject_id = %subject_id, "Account deletion cancelled");
        self.audit
            .record_for_subject(
                subject_id,
                AuditEventType::DeletionCancelled,
                origin,
                json!({ "was_scheduled_at": subject.deletion_scheduled_utc.map(|t| t.to_rfc3339()) }),
            )
            .await;
        Ok(())
    }

    /// Ordered purge steps for `subject` as of `as_of`.
    ///
    /// Fails if the subject points at a household that no longer exists;
    /// the sweep skips such subjects and retries them next run.
    pub async fn plan_purge(&self, subject: &Subject, as_of: DateTime<Utc>) -> Result<PurgePlan, ServiceError> {
        let mut steps = Vec::new();

        if let Some(household_id) = subject.household_id {
            let snapshot = self
                .accounts
                .find_household(household_id)
                .await
                .map_err(ServiceError::storage)?
                .ok_or_else(|| {
                    ServiceError::Internal(anyhow::anyhow!(
                        "Household {} referenced by subject is missing",
                        household_id
                    ))
                })?;

            if snapshot.member(subject.subject_id).is_some() {
                if snapshot.is_sole_member(subject.subject_id) {
                    steps.push(PurgeStep::DeleteHousehold { household_id });
                } else {
                    if snapshot.is_owned_by(subject.subject_id) {
                        if let Some(successor) = snapshot.successor_for(subject.subject_id) {
                            steps.push(PurgeStep::TransferOwnership(OwnershipTransfer {
                                household_id,
                                from_subject_id: subject.subject_id,
                                to_subject_id: successor.subject_id,
                            }));
                        }
                    }
                    steps.push(PurgeStep::RemoveMembership { household_id });
                }
            }
        }

        steps.extend([
            PurgeStep::DeleteRefreshTokens,
            PurgeStep::DeleteIdentityLinks,
            PurgeStep::AnonymizeAuditEvents,
            PurgeStep::DeleteSubject,
        ]);

        Ok(PurgePlan {
            subject_id: subject.subject_id,
            as_of,
            steps,
        })
    }

    /// Hard-delete every subject whose grace period ended at or before `now`.
    ///
    /// Each subject is purged independently; a failure is reported and the
    /// subject stays pending for the next sweep.
    pub async fn process_scheduled_deletions(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();
        let mut attempted: HashSet<Uuid> = HashSet::new();

        loop {
            let limit = SWEEP_BATCH_SIZE + attempted.len() as i64;
            let due: Vec<Subject> = self
                .accounts
                .find_due_for_deletion(now, limit)
                .await
                .map_err(ServiceError::storage)?
                .into_iter()
                .filter(|s| !attempted.contains(&s.subject_id))
                .collect();

            if due.is_empty() {
                break;
            }

            for subject in due {
                attempted.insert(subject.subject_id);
                match self.purge_one(&subject, now).await {
                    Ok(()) => report.purged.push(subject.subject_id),
                    Err(e) => {
                        tracing::error!(subject_id = %subject.subject_id, error = %e, "Account purge failed; will retry next sweep");
                        report.failed.push(SweepFailure {
                            subject_id: subject.subject_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        metrics::record_deletion_sweep("purged", report.purged.len() as u64);
        metrics::record_deletion_sweep("failed", report.failed.len() as u64);
        if !report.purged.is_empty() || !report.failed.is_empty() {
            tracing::info!(
                purged = report.purged.len(),
                failed = report.failed.len(),
                "Deletion sweep finished"
            );
        }
        Ok(report)
    }

    async fn purge_one(&self, subject: &Subject, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let plan = self.plan_purge(subject, now).await?;
        let outcome = self
            .accounts
            .purge_subject(&plan)
            .await
            .map_err(ServiceError::storage)?;

        // The subject is gone; nothing below may name it.
        self.audit
            .record_system(
                AuditEventType::AccountDeleted,
                json!({
                    "household_deleted": outcome.household_deleted,
                    "refresh_tokens_deleted": outcome.refresh_tokens_deleted,
                    "identity_links_deleted": outcome.identity_links_deleted,
                    "audit_events_anonymized": outcome.audit_events_anonymized,
                }),
            )
            .await;

        if let (Some(to), Some(household_id)) = (outcome.ownership_transferred_to, subject.household_id) {
            self.audit
                .record_for_subject(
                    to,
                    AuditEventType::HouseholdOwnershipTransferred,
                    &RequestOrigin::system(),
                    json!({ "household_id": household_id, "reason": "account_deleted" }),
                )
                .await;
        }
        Ok(())
    }
}
