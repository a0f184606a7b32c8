//! In-process store used by tests and by `STORAGE_BACKEND=memory`.
//!
//! All state sits behind one mutex, so every repository call is atomic. A
//! purge runs against a cloned snapshot that replaces the live state only if
//! every step succeeds.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AccountRepository, AuditRepository, DeviceCodeRepository, HealthCheck, RefreshTokenRepository,
};
use crate::models::{
    AuditEvent, AuditEventType, DeletionSchedule, DeviceCode, DeviceCodeStatus, Household,
    HouseholdInvite, HouseholdMember, HouseholdRole, HouseholdSnapshot, IdentityLink,
    OwnershipTransfer, PurgeOutcome, PurgePlan, PurgeStep, RefreshToken, ScheduleOutcome, Subject,
    SubjectStatus,
};

#[derive(Debug, Clone, Default)]
struct State {
    subjects: HashMap<Uuid, Subject>,
    identity_links: Vec<IdentityLink>,
    households: HashMap<Uuid, Household>,
    members: Vec<HouseholdMember>,
    invites: Vec<HouseholdInvite>,
    /// Keyed by token hash.
    refresh_tokens: HashMap<String, RefreshToken>,
    device_codes: HashMap<String, DeviceCode>,
    audit_events: Vec<AuditEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    purge_subjects: HashSet<Uuid>,
    audit_writes: bool,
    refresh_writes: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, anyhow::Error> {
        self.state
            .lock()
            .map_err(|e| anyhow!("Memory store mutex poisoned: {}", e))
    }

    fn faults(&self) -> Result<MutexGuard<'_, Faults>, anyhow::Error> {
        self.faults
            .lock()
            .map_err(|e| anyhow!("Memory store fault mutex poisoned: {}", e))
    }

    // ==================== Seeding and inspection ====================

    /// Insert a household with its members and invites, pointing each member
    /// subject at it.
    pub fn insert_household(
        &self,
        household: Household,
        members: Vec<HouseholdMember>,
        invites: Vec<HouseholdInvite>,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.state()?;
        for member in &members {
            if let Some(subject) = state.subjects.get_mut(&member.subject_id) {
                subject.household_id = Some(household.household_id);
            }
        }
        state.households.insert(household.household_id, household);
        state.members.extend(members);
        state.invites.extend(invites);
        Ok(())
    }

    /// Add a member to an existing household.
    pub fn add_member(&self, member: HouseholdMember) -> Result<(), anyhow::Error> {
        let mut state = self.state()?;
        if !state.households.contains_key(&member.household_id) {
            bail!("Household {} not found", member.household_id);
        }
        if state.members.iter().any(|m| m.subject_id == member.subject_id) {
            bail!("Subject {} already belongs to a household", member.subject_id);
        }
        if let Some(subject) = state.subjects.get_mut(&member.subject_id) {
            subject.household_id = Some(member.household_id);
        }
        state.members.push(member);
        Ok(())
    }

    /// Drop a household record but leave memberships and subject references
    /// dangling.
    pub fn remove_household_record(&self, household_id: Uuid) -> Result<(), anyhow::Error> {
        self.state()?.households.remove(&household_id);
        Ok(())
    }

    pub fn household_invites(&self, household_id: Uuid) -> Result<Vec<HouseholdInvite>, anyhow::Error> {
        Ok(self
            .state()?
            .invites
            .iter()
            .filter(|i| i.household_id == household_id)
            .cloned()
            .collect())
    }

    pub fn refresh_tokens_for(&self, subject_id: Uuid) -> Result<Vec<RefreshToken>, anyhow::Error> {
        Ok(self
            .state()?
            .refresh_tokens
            .values()
            .filter(|t| t.subject_id == subject_id)
            .cloned()
            .collect())
    }

    pub fn identity_links_for(&self, subject_id: Uuid) -> Result<Vec<IdentityLink>, anyhow::Error> {
        Ok(self
            .state()?
            .identity_links
            .iter()
            .filter(|l| l.subject_id == subject_id)
            .cloned()
            .collect())
    }

    pub fn audit_events(&self) -> Result<Vec<AuditEvent>, anyhow::Error> {
        Ok(self.state()?.audit_events.clone())
    }

    pub fn device_code_count(&self) -> Result<usize, anyhow::Error> {
        Ok(self.state()?.device_codes.len())
    }

    // ==================== Fault injection ====================

    /// Make the purge of `subject_id` fail after its first steps have run.
    pub fn fail_purge_for(&self, subject_id: Uuid) -> Result<(), anyhow::Error> {
        self.faults()?.purge_subjects.insert(subject_id);
        Ok(())
    }

    pub fn clear_purge_failure(&self, subject_id: Uuid) -> Result<(), anyhow::Error> {
        self.faults()?.purge_subjects.remove(&subject_id);
        Ok(())
    }

    pub fn fail_audit_writes(&self, fail: bool) -> Result<(), anyhow::Error> {
        self.faults()?.audit_writes = fail;
        Ok(())
    }

    pub fn fail_refresh_token_writes(&self, fail: bool) -> Result<(), anyhow::Error> {
        self.faults()?.refresh_writes = fail;
        Ok(())
    }

    fn check_refresh_writes(&self) -> Result<(), anyhow::Error> {
        if self.faults()?.refresh_writes {
            bail!("Injected refresh token storage failure");
        }
        Ok(())
    }
}

fn snapshot(state: &State, household_id: Uuid) -> Option<HouseholdSnapshot> {
    let household = state.households.get(&household_id)?.clone();
    let members = state
        .members
        .iter()
        .filter(|m| m.household_id == household_id)
        .cloned()
        .collect();
    Some(HouseholdSnapshot { household, members })
}

fn apply_transfer(state: &mut State, transfer: &OwnershipTransfer) -> Result<(), anyhow::Error> {
    let household = state
        .households
        .get_mut(&transfer.household_id)
        .ok_or_else(|| anyhow!("Household {} not found", transfer.household_id))?;
    if household.owner_subject_id != transfer.from_subject_id {
        bail!(
            "Household {} is no longer owned by {}",
            transfer.household_id,
            transfer.from_subject_id
        );
    }
    if !state
        .members
        .iter()
        .any(|m| m.household_id == transfer.household_id && m.subject_id == transfer.to_subject_id)
    {
        bail!(
            "Subject {} is not a member of household {}",
            transfer.to_subject_id,
            transfer.household_id
        );
    }

    household.owner_subject_id = transfer.to_subject_id;
    for member in state
        .members
        .iter_mut()
        .filter(|m| m.household_id == transfer.household_id)
    {
        if member.subject_id == transfer.to_subject_id {
            member.role = HouseholdRole::Owner;
        } else if member.subject_id == transfer.from_subject_id {
            member.role = HouseholdRole::Member;
        }
    }
    Ok(())
}

fn apply_purge_step(
    state: &mut State,
    plan: &PurgePlan,
    step: &PurgeStep,
    outcome: &mut PurgeOutcome,
) -> Result<(), anyhow::Error> {
    let subject_id = plan.subject_id;
    match step {
        PurgeStep::TransferOwnership(transfer) => {
            apply_transfer(state, transfer)?;
            outcome.ownership_transferred_to = Some(transfer.to_subject_id);
        }
        PurgeStep::RemoveMembership { household_id } => {
            state
                .members
                .retain(|m| !(m.household_id == *household_id && m.subject_id == subject_id));
        }
        PurgeStep::DeleteHousehold { household_id } => {
            if !state.households.contains_key(household_id) {
                bail!("Household {} not found", household_id);
            }
            if state
                .members
                .iter()
                .any(|m| m.household_id == *household_id && m.subject_id != subject_id)
            {
                bail!("Household {} gained members since the purge was planned", household_id);
            }
            state.invites.retain(|i| i.household_id != *household_id);
            state.members.retain(|m| m.household_id != *household_id);
            state.households.remove(household_id);
            outcome.household_deleted = true;
        }
        PurgeStep::DeleteRefreshTokens => {
            let before = state.refresh_tokens.len();
            state.refresh_tokens.retain(|_, t| t.subject_id != subject_id);
            outcome.refresh_tokens_deleted = (before - state.refresh_tokens.len()) as u64;
        }
        PurgeStep::DeleteIdentityLinks => {
            let before = state.identity_links.len();
            state.identity_links.retain(|l| l.subject_id != subject_id);
            outcome.identity_links_deleted = (before - state.identity_links.len()) as u64;
        }
        PurgeStep::AnonymizeAuditEvents => {
            let mut count = 0;
            for event in state
                .audit_events
                .iter_mut()
                .filter(|e| e.subject_id == Some(subject_id))
            {
                event.anonymize(plan.as_of);
                count += 1;
            }
            outcome.audit_events_anonymized = count;
        }
        PurgeStep::DeleteSubject => {
            let due = state
                .subjects
                .get(&subject_id)
                .map(|s| s.is_due_for_deletion(plan.as_of))
                .unwrap_or(false);
            if !due {
                bail!("Subject {} is no longer due for deletion", subject_id);
            }
            state.subjects.remove(&subject_id);
        }
    }
    Ok(())
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.state().map(|_| ())
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), anyhow::Error> {
        self.check_refresh_writes()?;
        let mut state = self.state()?;
        if state.refresh_tokens.contains_key(&token.token_hash) {
            bail!("Duplicate refresh token hash");
        }
        state
            .refresh_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, anyhow::Error> {
        Ok(self.state()?.refresh_tokens.get(token_hash).cloned())
    }

    async fn revoke_by_hash(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool, anyhow::Error> {
        self.check_refresh_writes()?;
        let mut state = self.state()?;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(token) => {
                token.revoked_at.get_or_insert(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all_for_subject(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        self.check_refresh_writes()?;
        let mut state = self.state()?;
        let mut count = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.subject_id == subject_id && t.is_valid(now))
        {
            token.revoked_at = Some(now);
            count += 1;
        }
        Ok(count)
    }

    async fn rotate(
        &self,
        old_hash: &str,
        subject_id: Uuid,
        replacement: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        self.check_refresh_writes()?;
        let mut state = self.state()?;
        let rotatable = state
            .refresh_tokens
            .get(old_hash)
            .map(|t| t.subject_id == subject_id && t.is_valid(now))
            .unwrap_or(false);
        if !rotatable {
            return Ok(false);
        }
        if state.refresh_tokens.contains_key(&replacement.token_hash) {
            bail!("Duplicate refresh token hash");
        }
        if let Some(old) = state.refresh_tokens.get_mut(old_hash) {
            old.revoked_at = Some(now);
        }
        state
            .refresh_tokens
            .insert(replacement.token_hash.clone(), replacement.clone());
        Ok(true)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let mut state = self.state()?;
        let before = state.refresh_tokens.len();
        state.refresh_tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - state.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl DeviceCodeRepository for MemoryStore {
    async fn insert(&self, code: &DeviceCode) -> Result<bool, anyhow::Error> {
        let mut state = self.state()?;
        if state
            .device_codes
            .values()
            .any(|c| c.user_code == code.user_code)
        {
            return Ok(false);
        }
        if state.device_codes.contains_key(&code.device_code) {
            bail!("Duplicate device code");
        }
        state
            .device_codes
            .insert(code.device_code.clone(), code.clone());
        Ok(true)
    }

    async fn find_by_device_code(&self, device_code: &str) -> Result<Option<DeviceCode>, anyhow::Error> {
        Ok(self.state()?.device_codes.get(device_code).cloned())
    }

    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<DeviceCode>, anyhow::Error> {
        Ok(self
            .state()?
            .device_codes
            .values()
            .find(|c| c.user_code == user_code)
            .cloned())
    }

    async fn record_poll(&self, device_code: &str, now: DateTime<Utc>) -> Result<Option<DeviceCode>, anyhow::Error> {
        let mut state = self.state()?;
        Ok(state.device_codes.get_mut(device_code).map(|code| {
            let before = code.clone();
            code.last_polled_at = Some(now);
            before
        }))
    }

    async fn transition(
        &self,
        device_code: &str,
        from: DeviceCodeStatus,
        to: DeviceCodeStatus,
        subject_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let mut state = self.state()?;
        match state.device_codes.get_mut(device_code) {
            Some(code) if code.status == from && !code.is_expired(now) => {
                code.status = to;
                if subject_id.is_some() {
                    code.subject_id = subject_id;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let mut state = self.state()?;
        let before = state.device_codes.len();
        state.device_codes.retain(|_, c| !c.is_expired(now));
        Ok((before - state.device_codes.len()) as u64)
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn find_subject(&self, subject_id: Uuid) -> Result<Option<Subject>, anyhow::Error> {
        Ok(self.state()?.subjects.get(&subject_id).cloned())
    }

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<Subject>, anyhow::Error> {
        Ok(self
            .state()?
            .subjects
            .values()
            .find(|s| s.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_subject_by_identity(
        &self,
        provider_code: &str,
        provider_subject: &str,
    ) -> Result<Option<Subject>, anyhow::Error> {
        let state = self.state()?;
        Ok(state
            .identity_links
            .iter()
            .find(|l| l.provider_code == provider_code && l.provider_subject == provider_subject)
            .and_then(|l| state.subjects.get(&l.subject_id))
            .cloned())
    }

    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error> {
        let mut state = self.state()?;
        if state
            .subjects
            .values()
            .any(|s| s.email.eq_ignore_ascii_case(&subject.email))
        {
            bail!("Email {} already registered", subject.email);
        }
        state.subjects.insert(subject.subject_id, subject.clone());
        Ok(())
    }

    async fn insert_identity_link(&self, link: &IdentityLink) -> Result<(), anyhow::Error> {
        let mut state = self.state()?;
        if state.identity_links.iter().any(|l| {
            l.provider_code == link.provider_code && l.provider_subject == link.provider_subject
        }) {
            bail!("Identity link already exists");
        }
        state.identity_links.push(link.clone());
        Ok(())
    }

    async fn find_household(&self, household_id: Uuid) -> Result<Option<HouseholdSnapshot>, anyhow::Error> {
        Ok(snapshot(&*self.state()?, household_id))
    }

    async fn schedule_deletion(&self, schedule: &DeletionSchedule) -> Result<ScheduleOutcome, anyhow::Error> {
        let mut state = self.state()?;
        match state.subjects.get(&schedule.subject_id) {
            Some(s) if s.status == SubjectStatus::Active => {}
            _ => return Ok(ScheduleOutcome::NotActive),
        }

        let mut next = state.clone();
        if let Some(transfer) = &schedule.ownership_transfer {
            if apply_transfer(&mut next, transfer).is_err() {
                return Ok(ScheduleOutcome::OwnershipChanged);
            }
        }
        if let Some(subject) = next.subjects.get_mut(&schedule.subject_id) {
            subject.status = SubjectStatus::PendingDeletion;
            subject.deletion_scheduled_utc = Some(schedule.scheduled_at);
        }
        *state = next;
        Ok(ScheduleOutcome::Scheduled)
    }

    async fn cancel_deletion(&self, subject_id: Uuid) -> Result<bool, anyhow::Error> {
        let mut state = self.state()?;
        match state.subjects.get_mut(&subject_id) {
            Some(subject) if subject.status == SubjectStatus::PendingDeletion => {
                subject.status = SubjectStatus::Active;
                subject.deletion_scheduled_utc = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_due_for_deletion(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Subject>, anyhow::Error> {
        let state = self.state()?;
        let mut due: Vec<Subject> = state
            .subjects
            .values()
            .filter(|s| s.is_due_for_deletion(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.deletion_scheduled_utc
                .cmp(&b.deletion_scheduled_utc)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn purge_subject(&self, plan: &PurgePlan) -> Result<PurgeOutcome, anyhow::Error> {
        let inject_failure = self.faults()?.purge_subjects.contains(&plan.subject_id);
        let mut state = self.state()?;
        let mut working = state.clone();
        let mut outcome = PurgeOutcome::default();

        for (index, step) in plan.steps.iter().enumerate() {
            if inject_failure && index + 1 == plan.steps.len() {
                bail!("Injected purge failure for subject {}", plan.subject_id);
            }
            apply_purge_step(&mut working, plan, step, &mut outcome)?;
        }

        *state = working;
        Ok(outcome)
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn insert(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        if self.faults()?.audit_writes {
            bail!("Injected audit storage failure");
        }
        self.state()?.audit_events.push(event.clone());
        Ok(())
    }

    async fn find_by_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let state = self.state()?;
        Ok(state
            .audit_events
            .iter()
            .rev()
            .filter(|e| e.subject_id == Some(subject_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_by_type(&self, event_type: AuditEventType, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        let state = self.state()?;
        Ok(state
            .audit_events
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_since(
        &self,
        event_type: AuditEventType,
        subject_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error> {
        let state = self.state()?;
        Ok(state
            .audit_events
            .iter()
            .filter(|e| e.event_type == event_type && e.created_utc >= since)
            .filter(|e| subject_id.is_none() || e.subject_id == subject_id)
            .count() as i64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let mut state = self.state()?;
        let before = state.audit_events.len();
        state.audit_events.retain(|e| e.created_utc >= cutoff);
        Ok((before - state.audit_events.len()) as u64)
    }
}
