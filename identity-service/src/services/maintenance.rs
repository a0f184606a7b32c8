//! Periodic housekeeping: the deletion sweep, garbage collection of expired
//! refresh tokens and device codes, and audit retention.

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::clock::Clock;
use crate::services::account::AccountLifecycleService;
use crate::services::audit::AuditLogService;
use crate::services::device_auth::DeviceAuthorizationService;
use crate::services::refresh_tokens::RefreshTokenStore;

/// What one maintenance pass did. `None` means that job failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub subjects_purged: Option<usize>,
    pub subjects_failed: Option<usize>,
    pub refresh_tokens_deleted: Option<u64>,
    pub device_codes_deleted: Option<u64>,
    pub audit_events_purged: Option<u64>,
}

#[derive(Clone)]
pub struct MaintenanceRunner {
    accounts: AccountLifecycleService,
    refresh_tokens: RefreshTokenStore,
    device: DeviceAuthorizationService,
    audit: AuditLogService,
    clock: Arc<dyn Clock>,
    audit_retention: ChronoDuration,
    period: Duration,
}

impl MaintenanceRunner {
    pub fn new(
        accounts: AccountLifecycleService,
        refresh_tokens: RefreshTokenStore,
        device: DeviceAuthorizationService,
        audit: AuditLogService,
        clock: Arc<dyn Clock>,
        audit_retention_days: i64,
        period: Duration,
    ) -> Self {
        Self {
            accounts,
            refresh_tokens,
            device,
            audit,
            clock,
            audit_retention: ChronoDuration::days(audit_retention_days),
            period,
        }
    }

    /// Run every job once. Each job's failure is logged and the others still run.
    pub async fn run_once(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        match self.accounts.process_scheduled_deletions(now).await {
            Ok(sweep) => {
                report.subjects_purged = Some(sweep.purged.len());
                report.subjects_failed = Some(sweep.failed.len());
            }
            Err(e) => tracing::error!(error = %e, "Deletion sweep failed"),
        }

        match self.refresh_tokens.cleanup_expired().await {
            Ok(deleted) => report.refresh_tokens_deleted = Some(deleted),
            Err(e) => tracing::error!(error = %e, "Refresh token cleanup failed"),
        }

        match self.device.cleanup_expired().await {
            Ok(deleted) => report.device_codes_deleted = Some(deleted),
            Err(e) => tracing::error!(error = %e, "Device code cleanup failed"),
        }

        match self.audit.purge_older_than(now - self.audit_retention).await {
            Ok(deleted) => report.audit_events_purged = Some(deleted),
            Err(e) => tracing::error!(error = %e, "Audit retention purge failed"),
        }

        tracing::debug!(?report, "Maintenance pass finished");
        report
    }

    /// Start the background loop. The first pass runs immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            tracing::info!(interval_secs = self.period.as_secs(), "Starting maintenance runner");

            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
