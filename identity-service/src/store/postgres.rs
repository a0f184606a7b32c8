//! PostgreSQL backend.
//!
//! Atomic operations are single conditional statements or one transaction;
//! callers never compose several repository calls into a unit.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{
    AccountRepository, AuditRepository, DeviceCodeRepository, HealthCheck, RefreshTokenRepository,
};
use crate::config::DatabaseConfig;
use crate::models::{
    AuditEvent, AuditEventType, DeletionSchedule, DeviceCode, DeviceCodeStatus, DeviceMetadata,
    Household, HouseholdMember, HouseholdSnapshot, IdentityLink, OwnershipTransfer, PurgeOutcome,
    PurgePlan, PurgeStep, RefreshToken, ScheduleOutcome, Subject,
};

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

// ==================== Row mapping ====================

#[derive(FromRow)]
struct SubjectRow {
    subject_id: Uuid,
    email: String,
    display_name: Option<String>,
    status_code: String,
    household_id: Option<Uuid>,
    deletion_scheduled_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<SubjectRow> for Subject {
    type Error = anyhow::Error;

    fn try_from(row: SubjectRow) -> Result<Self, Self::Error> {
        Ok(Subject {
            subject_id: row.subject_id,
            email: row.email,
            display_name: row.display_name,
            status: row.status_code.parse().map_err(|e: String| anyhow!(e))?,
            household_id: row.household_id,
            deletion_scheduled_utc: row.deletion_scheduled_utc,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct RefreshTokenRow {
    token_id: Uuid,
    subject_id: Uuid,
    token_hash_text: String,
    device_name: Option<String>,
    client_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    expiry_utc: DateTime<Utc>,
    revoked_utc: Option<DateTime<Utc>>,
    created_utc: DateTime<Utc>,
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        RefreshToken {
            token_id: row.token_id,
            subject_id: row.subject_id,
            token_hash: row.token_hash_text,
            device: DeviceMetadata {
                device_name: row.device_name,
                client_id: row.client_id,
                ip_address: row.ip_address,
                user_agent: row.user_agent,
            },
            expires_at: row.expiry_utc,
            created_at: row.created_utc,
            revoked_at: row.revoked_utc,
        }
    }
}

#[derive(FromRow)]
struct DeviceCodeRow {
    device_code: String,
    user_code: String,
    client_id: String,
    status_code: String,
    subject_id: Option<Uuid>,
    interval_seconds: i64,
    last_polled_utc: Option<DateTime<Utc>>,
    expiry_utc: DateTime<Utc>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<DeviceCodeRow> for DeviceCode {
    type Error = anyhow::Error;

    fn try_from(row: DeviceCodeRow) -> Result<Self, Self::Error> {
        Ok(DeviceCode {
            device_code: row.device_code,
            user_code: row.user_code,
            client_id: row.client_id,
            status: row.status_code.parse().map_err(|e: String| anyhow!(e))?,
            subject_id: row.subject_id,
            interval_seconds: row.interval_seconds,
            last_polled_at: row.last_polled_utc,
            expires_at: row.expiry_utc,
            created_at: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct MemberRow {
    household_id: Uuid,
    subject_id: Uuid,
    role_code: String,
    joined_utc: DateTime<Utc>,
}

impl TryFrom<MemberRow> for HouseholdMember {
    type Error = anyhow::Error;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        Ok(HouseholdMember {
            household_id: row.household_id,
            subject_id: row.subject_id,
            role: row.role_code.parse().map_err(|e: String| anyhow!(e))?,
            joined_utc: row.joined_utc,
        })
    }
}

#[derive(FromRow)]
struct AuditEventRow {
    event_id: Uuid,
    subject_id: Option<Uuid>,
    event_type_code: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    event_data: serde_json::Value,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = anyhow::Error;

    fn try_from(row: AuditEventRow) -> Result<Self, Self::Error> {
        Ok(AuditEvent {
            event_id: row.event_id,
            subject_id: row.subject_id,
            event_type: row.event_type_code.parse().map_err(|e: String| anyhow!(e))?,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            event_data: row.event_data,
            created_utc: row.created_utc,
        })
    }
}

const SUBJECT_COLUMNS: &str = "subject_id, email, display_name, status_code, household_id, deletion_scheduled_utc, created_utc";
const DEVICE_CODE_COLUMNS: &str = "device_code, user_code, client_id, status_code, subject_id, interval_seconds, last_polled_utc, expiry_utc, created_utc";

/// PostgreSQL store implementing every repository.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transfer_ownership(
        tx: &mut Transaction<'_, Postgres>,
        transfer: &OwnershipTransfer,
    ) -> Result<bool, anyhow::Error> {
        let moved = sqlx::query(
            r#"
            UPDATE households SET owner_subject_id = $3
            WHERE household_id = $1 AND owner_subject_id = $2
              AND EXISTS (
                  SELECT 1 FROM household_members
                  WHERE household_id = $1 AND subject_id = $3
              )
            "#,
        )
        .bind(transfer.household_id)
        .bind(transfer.from_subject_id)
        .bind(transfer.to_subject_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        if moved == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE household_members
            SET role_code = CASE WHEN subject_id = $3 THEN 'owner' ELSE 'member' END
            WHERE household_id = $1 AND subject_id IN ($2, $3)
            "#,
        )
        .bind(transfer.household_id)
        .bind(transfer.from_subject_id)
        .bind(transfer.to_subject_id)
        .execute(&mut **tx)
        .await?;
        Ok(true)
    }

    async fn apply_purge_step(
        tx: &mut Transaction<'_, Postgres>,
        plan: &PurgePlan,
        step: &PurgeStep,
        outcome: &mut PurgeOutcome,
    ) -> Result<(), anyhow::Error> {
        let subject_id = plan.subject_id;
        match step {
            PurgeStep::TransferOwnership(transfer) => {
                if !Self::transfer_ownership(tx, transfer).await? {
                    bail!("Household {} is no longer owned by {}", transfer.household_id, subject_id);
                }
                outcome.ownership_transferred_to = Some(transfer.to_subject_id);
            }
            PurgeStep::RemoveMembership { household_id } => {
                sqlx::query("DELETE FROM household_members WHERE household_id = $1 AND subject_id = $2")
                    .bind(household_id)
                    .bind(subject_id)
                    .execute(&mut **tx)
                    .await?;
            }
            PurgeStep::DeleteHousehold { household_id } => {
                let others: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM household_members WHERE household_id = $1 AND subject_id <> $2",
                )
                .bind(household_id)
                .bind(subject_id)
                .fetch_one(&mut **tx)
                .await?;
                if others > 0 {
                    bail!("Household {} gained members since the purge was planned", household_id);
                }
                sqlx::query("DELETE FROM household_invites WHERE household_id = $1")
                    .bind(household_id)
                    .execute(&mut **tx)
                    .await?;
                sqlx::query("DELETE FROM household_members WHERE household_id = $1")
                    .bind(household_id)
                    .execute(&mut **tx)
                    .await?;
                let deleted = sqlx::query("DELETE FROM households WHERE household_id = $1")
                    .bind(household_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    bail!("Household {} not found", household_id);
                }
                outcome.household_deleted = true;
            }
            PurgeStep::DeleteRefreshTokens => {
                outcome.refresh_tokens_deleted = sqlx::query("DELETE FROM refresh_tokens WHERE subject_id = $1")
                    .bind(subject_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
            }
            PurgeStep::DeleteIdentityLinks => {
                outcome.identity_links_deleted = sqlx::query("DELETE FROM identity_links WHERE subject_id = $1")
                    .bind(subject_id)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
            }
            PurgeStep::AnonymizeAuditEvents => {
                outcome.audit_events_anonymized = sqlx::query(
                    r#"
                    UPDATE audit_events
                    SET subject_id = NULL,
                        event_data = event_data || jsonb_build_object('anonymized', true, 'anonymized_at', $2::text)
                    WHERE subject_id = $1
                    "#,
                )
                .bind(subject_id)
                .bind(plan.as_of.to_rfc3339())
                .execute(&mut **tx)
                .await?
                .rows_affected();
            }
            PurgeStep::DeleteSubject => {
                let deleted = sqlx::query(
                    r#"
                    DELETE FROM subjects
                    WHERE subject_id = $1
                      AND status_code = 'pending_deletion'
                      AND deletion_scheduled_utc <= $2
                    "#,
                )
                .bind(subject_id)
                .bind(plan.as_of)
                .execute(&mut **tx)
                .await?
                .rows_affected();
                if deleted == 0 {
                    bail!("Subject {} is no longer due for deletion", subject_id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthCheck for PgStore {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                anyhow!("Database health check failed: {}", e)
            })?;
        Ok(())
    }
}

// ==================== Refresh Token Operations ====================

#[async_trait]
impl RefreshTokenRepository for PgStore {
    async fn insert(&self, token: &RefreshToken) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_id, subject_id, token_hash_text, device_name, client_id, ip_address, user_agent, expiry_utc, revoked_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(token.token_id)
        .bind(token.subject_id)
        .bind(&token.token_hash)
        .bind(&token.device.device_name)
        .bind(&token.device.client_id)
        .bind(&token.device.ip_address)
        .bind(&token.device.user_agent)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert refresh token")?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>, anyhow::Error> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            "SELECT * FROM refresh_tokens WHERE token_hash_text = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshToken::from))
    }

    async fn revoke_by_hash(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_utc = COALESCE(revoked_utc, $2) WHERE token_hash_text = $1",
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all_for_subject(&self, subject_id: Uuid, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens SET revoked_utc = $2
            WHERE subject_id = $1 AND revoked_utc IS NULL AND expiry_utc > $2
            "#,
        )
        .bind(subject_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn rotate(
        &self,
        old_hash: &str,
        subject_id: Uuid,
        replacement: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let mut tx = self.pool.begin().await?;

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens SET revoked_utc = $3
            WHERE token_hash_text = $1 AND subject_id = $2
              AND revoked_utc IS NULL AND expiry_utc > $3
            "#,
        )
        .bind(old_hash)
        .bind(subject_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if revoked == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_id, subject_id, token_hash_text, device_name, client_id, ip_address, user_agent, expiry_utc, revoked_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9)
            "#,
        )
        .bind(replacement.token_id)
        .bind(replacement.subject_id)
        .bind(&replacement.token_hash)
        .bind(&replacement.device.device_name)
        .bind(&replacement.device.client_id)
        .bind(&replacement.device.ip_address)
        .bind(&replacement.device.user_agent)
        .bind(replacement.expires_at)
        .bind(replacement.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert rotated refresh token")?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expiry_utc <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Device Code Operations ====================

#[async_trait]
impl DeviceCodeRepository for PgStore {
    async fn insert(&self, code: &DeviceCode) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO device_codes (device_code, user_code, client_id, status_code, subject_id, interval_seconds, last_polled_utc, expiry_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_code) DO NOTHING
            "#,
        )
        .bind(&code.device_code)
        .bind(&code.user_code)
        .bind(&code.client_id)
        .bind(code.status.as_str())
        .bind(code.subject_id)
        .bind(code.interval_seconds)
        .bind(code.last_polled_at)
        .bind(code.expires_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert device code")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_device_code(&self, device_code: &str) -> Result<Option<DeviceCode>, anyhow::Error> {
        let row = sqlx::query_as::<_, DeviceCodeRow>(&format!(
            "SELECT {} FROM device_codes WHERE device_code = $1",
            DEVICE_CODE_COLUMNS
        ))
        .bind(device_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeviceCode::try_from).transpose()
    }

    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<DeviceCode>, anyhow::Error> {
        let row = sqlx::query_as::<_, DeviceCodeRow>(&format!(
            "SELECT {} FROM device_codes WHERE user_code = $1",
            DEVICE_CODE_COLUMNS
        ))
        .bind(user_code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DeviceCode::try_from).transpose()
    }

    async fn record_poll(&self, device_code: &str, now: DateTime<Utc>) -> Result<Option<DeviceCode>, anyhow::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DeviceCodeRow>(&format!(
            "SELECT {} FROM device_codes WHERE device_code = $1 FOR UPDATE",
            DEVICE_CODE_COLUMNS
        ))
        .bind(device_code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE device_codes SET last_polled_utc = $2 WHERE device_code = $1")
            .bind(device_code)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        DeviceCode::try_from(row).map(Some)
    }

    async fn transition(
        &self,
        device_code: &str,
        from: DeviceCodeStatus,
        to: DeviceCodeStatus,
        subject_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE device_codes
            SET status_code = $3, subject_id = COALESCE($4, subject_id)
            WHERE device_code = $1 AND status_code = $2 AND expiry_utc > $5
            "#,
        )
        .bind(device_code)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(subject_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM device_codes WHERE expiry_utc <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ==================== Account Operations ====================

#[async_trait]
impl AccountRepository for PgStore {
    async fn find_subject(&self, subject_id: Uuid) -> Result<Option<Subject>, anyhow::Error> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!(
            "SELECT {} FROM subjects WHERE subject_id = $1",
            SUBJECT_COLUMNS
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subject::try_from).transpose()
    }

    async fn find_subject_by_email(&self, email: &str) -> Result<Option<Subject>, anyhow::Error> {
        let row = sqlx::query_as::<_, SubjectRow>(&format!(
            "SELECT {} FROM subjects WHERE LOWER(email) = LOWER($1)",
            SUBJECT_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subject::try_from).transpose()
    }

    async fn find_subject_by_identity(
        &self,
        provider_code: &str,
        provider_subject: &str,
    ) -> Result<Option<Subject>, anyhow::Error> {
        let row = sqlx::query_as::<_, SubjectRow>(
            r#"
            SELECT s.subject_id, s.email, s.display_name, s.status_code, s.household_id,
                   s.deletion_scheduled_utc, s.created_utc
            FROM subjects s
            JOIN identity_links l ON l.subject_id = s.subject_id
            WHERE l.provider_code = $1 AND l.provider_subject = $2
            "#,
        )
        .bind(provider_code)
        .bind(provider_subject)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subject::try_from).transpose()
    }

    async fn insert_subject(&self, subject: &Subject) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO subjects (subject_id, email, display_name, status_code, household_id, deletion_scheduled_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(subject.subject_id)
        .bind(&subject.email)
        .bind(&subject.display_name)
        .bind(subject.status.as_str())
        .bind(subject.household_id)
        .bind(subject.deletion_scheduled_utc)
        .bind(subject.created_utc)
        .execute(&self.pool)
        .await
        .context("Failed to insert subject")?;
        Ok(())
    }

    async fn insert_identity_link(&self, link: &IdentityLink) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO identity_links (link_id, subject_id, provider_code, provider_subject, created_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(link.link_id)
        .bind(link.subject_id)
        .bind(&link.provider_code)
        .bind(&link.provider_subject)
        .bind(link.created_utc)
        .execute(&self.pool)
        .await
        .context("Failed to insert identity link")?;
        Ok(())
    }

    async fn find_household(&self, household_id: Uuid) -> Result<Option<HouseholdSnapshot>, anyhow::Error> {
        let household = sqlx::query_as::<_, (Uuid, String, Uuid, DateTime<Utc>)>(
            "SELECT household_id, household_name, owner_subject_id, created_utc FROM households WHERE household_id = $1",
        )
        .bind(household_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((household_id, household_name, owner_subject_id, created_utc)) = household else {
            return Ok(None);
        };

        let members = sqlx::query_as::<_, MemberRow>(
            "SELECT household_id, subject_id, role_code, joined_utc FROM household_members WHERE household_id = $1",
        )
        .bind(household_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(HouseholdMember::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(HouseholdSnapshot {
            household: Household {
                household_id,
                household_name,
                owner_subject_id,
                created_utc,
            },
            members,
        }))
    }

    async fn schedule_deletion(&self, schedule: &DeletionSchedule) -> Result<ScheduleOutcome, anyhow::Error> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE subjects
            SET status_code = 'pending_deletion', deletion_scheduled_utc = $2
            WHERE subject_id = $1 AND status_code = 'active'
            "#,
        )
        .bind(schedule.subject_id)
        .bind(schedule.scheduled_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped == 0 {
            tx.rollback().await?;
            return Ok(ScheduleOutcome::NotActive);
        }

        if let Some(transfer) = &schedule.ownership_transfer {
            if !Self::transfer_ownership(&mut tx, transfer).await? {
                tx.rollback().await?;
                return Ok(ScheduleOutcome::OwnershipChanged);
            }
        }

        tx.commit().await?;
        Ok(ScheduleOutcome::Scheduled)
    }

    async fn cancel_deletion(&self, subject_id: Uuid) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            r#"
            UPDATE subjects
            SET status_code = 'active', deletion_scheduled_utc = NULL
            WHERE subject_id = $1 AND status_code = 'pending_deletion'
            "#,
        )
        .bind(subject_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_due_for_deletion(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Subject>, anyhow::Error> {
        sqlx::query_as::<_, SubjectRow>(&format!(
            r#"
            SELECT {} FROM subjects
            WHERE status_code = 'pending_deletion' AND deletion_scheduled_utc <= $1
            ORDER BY deletion_scheduled_utc, subject_id
            LIMIT $2
            "#,
            SUBJECT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Subject::try_from)
        .collect()
    }

    async fn purge_subject(&self, plan: &PurgePlan) -> Result<PurgeOutcome, anyhow::Error> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = PurgeOutcome::default();

        for step in &plan.steps {
            // Dropping the transaction on error rolls it back.
            Self::apply_purge_step(&mut tx, plan, step, &mut outcome).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

// ==================== Audit Operations ====================

#[async_trait]
impl AuditRepository for PgStore {
    async fn insert(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, subject_id, event_type_code, ip_address, user_agent, event_data, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id)
        .bind(event.subject_id)
        .bind(event.event_type.as_str())
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.event_data)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await
        .context("Failed to insert audit event")?;
        Ok(())
    }

    async fn find_by_subject(&self, subject_id: Uuid, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        sqlx::query_as::<_, AuditEventRow>(
            "SELECT * FROM audit_events WHERE subject_id = $1 ORDER BY created_utc DESC LIMIT $2",
        )
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(AuditEvent::try_from)
        .collect()
    }

    async fn find_by_type(&self, event_type: AuditEventType, limit: i64) -> Result<Vec<AuditEvent>, anyhow::Error> {
        sqlx::query_as::<_, AuditEventRow>(
            "SELECT * FROM audit_events WHERE event_type_code = $1 ORDER BY created_utc DESC LIMIT $2",
        )
        .bind(event_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(AuditEvent::try_from)
        .collect()
    }

    async fn count_since(
        &self,
        event_type: AuditEventType,
        subject_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<i64, anyhow::Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM audit_events
            WHERE event_type_code = $1 AND created_utc >= $2
              AND ($3::uuid IS NULL OR subject_id = $3)
            "#,
        )
        .bind(event_type.as_str())
        .bind(since)
        .bind(subject_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, anyhow::Error> {
        let result = sqlx::query("DELETE FROM audit_events WHERE created_utc < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn test_store() -> PgStore {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/identity_test".to_string()),
            max_connections: 5,
            min_connections: 1,
        };
        let pool = create_pool(&config).await.expect("connect");
        run_migrations(&pool).await.expect("migrate");
        PgStore::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_rotation_against_postgres() {
        let store = test_store().await;
        let now = Utc::now();
        let subject = Subject::new(format!("{}@example.com", Uuid::new_v4()), None, now);
        store.insert_subject(&subject).await.unwrap();

        let old = RefreshToken::new(subject.subject_id, &Uuid::new_v4().to_string(), DeviceMetadata::default(), now, ChronoDuration::days(7));
        RefreshTokenRepository::insert(&store, &old).await.unwrap();

        let new = RefreshToken::new(subject.subject_id, &Uuid::new_v4().to_string(), DeviceMetadata::default(), now, ChronoDuration::days(7));
        assert!(store.rotate(&old.token_hash, subject.subject_id, &new, now).await.unwrap());
        assert!(!store.rotate(&old.token_hash, subject.subject_id, &new, now).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_record_poll_returns_previous_time() {
        let store = test_store().await;
        let now = Utc::now();
        let code = DeviceCode::new(
            Uuid::new_v4().to_string(),
            format!("T{}", &Uuid::new_v4().simple().to_string()[..8]),
            "cli",
            now,
            ChronoDuration::minutes(15),
            ChronoDuration::seconds(5),
        );
        assert!(DeviceCodeRepository::insert(&store, &code).await.unwrap());

        let first = store.record_poll(&code.device_code, now).await.unwrap().unwrap();
        assert!(first.last_polled_at.is_none());
        let second = store.record_poll(&code.device_code, now).await.unwrap().unwrap();
        assert!(second.last_polled_at.is_some());
    }
}
