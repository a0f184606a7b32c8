//! Account deletion plans applied atomically by the account repository.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Move household ownership from a leaving owner to another member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnershipTransfer {
    pub household_id: Uuid,
    pub from_subject_id: Uuid,
    pub to_subject_id: Uuid,
}

/// Status flip to `pending_deletion`, plus the ownership handoff when the
/// subject owns a shared household. Applied as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionSchedule {
    pub subject_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub ownership_transfer: Option<OwnershipTransfer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// The subject was no longer active.
    NotActive,
    /// The household owner changed between read and write.
    OwnershipChanged,
}

/// One step of a hard delete, executed in order inside one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PurgeStep {
    TransferOwnership(OwnershipTransfer),
    RemoveMembership { household_id: Uuid },
    /// Deletes invites, the last membership and the household itself.
    DeleteHousehold { household_id: Uuid },
    DeleteRefreshTokens,
    DeleteIdentityLinks,
    AnonymizeAuditEvents,
    DeleteSubject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurgePlan {
    pub subject_id: Uuid,
    /// Sweep time; the subject row is only deleted if still due at this time.
    pub as_of: DateTime<Utc>,
    pub steps: Vec<PurgeStep>,
}

impl PurgePlan {
    pub fn deletes_household(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, PurgeStep::DeleteHousehold { .. }))
    }
}

/// Counts reported back by a committed purge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    pub refresh_tokens_deleted: u64,
    pub identity_links_deleted: u64,
    pub audit_events_anonymized: u64,
    pub household_deleted: bool,
    pub ownership_transferred_to: Option<Uuid>,
}
