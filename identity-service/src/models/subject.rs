//! Identity subject model - the account behind every token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a subject.
///
/// `Active -> PendingDeletion -> Active` (cancel) or `PendingDeletion -> <purged>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectStatus {
    Active,
    PendingDeletion,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectStatus::Active => "active",
            SubjectStatus::PendingDeletion => "pending_deletion",
        }
    }
}

impl FromStr for SubjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubjectStatus::Active),
            "pending_deletion" => Ok(SubjectStatus::PendingDeletion),
            other => Err(format!("Unknown subject status: {}", other)),
        }
    }
}

/// Subject entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub subject_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub status: SubjectStatus,
    /// Weak reference to the household the subject belongs to.
    pub household_id: Option<Uuid>,
    pub deletion_scheduled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Subject {
    /// Create a new active subject.
    pub fn new(email: impl Into<String>, display_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            subject_id: Uuid::new_v4(),
            email: email.into(),
            display_name,
            status: SubjectStatus::Active,
            household_id: None,
            deletion_scheduled_utc: None,
            created_utc: now,
        }
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.status == SubjectStatus::PendingDeletion
    }

    /// True once the grace period has run out.
    pub fn is_due_for_deletion(&self, now: DateTime<Utc>) -> bool {
        self.is_pending_deletion()
            && self
                .deletion_scheduled_utc
                .map(|at| at <= now)
                .unwrap_or(false)
    }
}

/// Link between a subject and an external OAuth provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub link_id: Uuid,
    pub subject_id: Uuid,
    pub provider_code: String,
    pub provider_subject: String,
    pub created_utc: DateTime<Utc>,
}

impl IdentityLink {
    pub fn new(
        subject_id: Uuid,
        provider_code: impl Into<String>,
        provider_subject: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            link_id: Uuid::new_v4(),
            subject_id,
            provider_code: provider_code.into(),
            provider_subject: provider_subject.into(),
            created_utc: now,
        }
    }
}

/// Identity already verified by the external OAuth collaborator.
///
/// Raw provider tokens never reach this service; only this tuple does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub provider: String,
    pub provider_subject: String,
    pub email: String,
    pub display_name: Option<String>,
}
