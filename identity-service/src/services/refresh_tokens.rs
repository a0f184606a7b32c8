use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{DeviceMetadata, RefreshToken};
use crate::services::error::ServiceError;
use crate::services::jwt::JwtService;
use crate::store::RefreshTokenRepository;

/// Hashed refresh token persistence with single-use rotation.
#[derive(Clone)]
pub struct RefreshTokenStore {
    repo: Arc<dyn RefreshTokenRepository>,
    clock: Arc<dyn Clock>,
    validity: Duration,
}

impl RefreshTokenStore {
    pub fn new(repo: Arc<dyn RefreshTokenRepository>, clock: Arc<dyn Clock>, validity: Duration) -> Self {
        Self { repo, clock, validity }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Persist the hash of `secret` for `subject_id`.
    pub async fn store(
        &self,
        subject_id: Uuid,
        secret: &str,
        device: DeviceMetadata,
    ) -> Result<RefreshToken, ServiceError> {
        let record = RefreshToken::new(subject_id, secret, device, self.clock.now(), self.validity);
        self.repo.insert(&record).await.map_err(ServiceError::storage)?;
        Ok(record)
    }

    /// The record behind `secret` if it is valid right now.
    pub async fn validate(&self, secret: &str) -> Result<Option<RefreshToken>, ServiceError> {
        let now = self.clock.now();
        Ok(self.lookup(secret).await?.filter(|t| t.is_valid(now)))
    }

    /// The record behind `secret` whatever its state.
    pub async fn lookup(&self, secret: &str) -> Result<Option<RefreshToken>, ServiceError> {
        self.repo
            .find_by_hash(&JwtService::hash_secret(secret))
            .await
            .map_err(ServiceError::storage)
    }

    /// Revoke one token. Safe to repeat; returns false only for unknown secrets.
    pub async fn revoke(&self, secret: &str) -> Result<bool, ServiceError> {
        self.repo
            .revoke_by_hash(&JwtService::hash_secret(secret), self.clock.now())
            .await
            .map_err(ServiceError::storage)
    }

    pub async fn revoke_all(&self, subject_id: Uuid) -> Result<u64, ServiceError> {
        let count = self
            .repo
            .revoke_all_for_subject(subject_id, self.clock.now())
            .await
            .map_err(ServiceError::storage)?;
        tracing::info!(subject_id = %subject_id, count, "Revoked all refresh tokens");
        Ok(count)
    }

    /// Swap `old_secret` for a new secret in one atomic step.
    ///
    /// Fails with `RotationFailed`, issuing nothing, if the old token is
    /// unknown, expired, revoked or owned by someone else.
    pub async fn rotate(
        &self,
        old_secret: &str,
        subject_id: Uuid,
        device: DeviceMetadata,
    ) -> Result<String, ServiceError> {
        let now = self.clock.now();
        let new_secret = JwtService::generate_refresh_secret();
        let replacement = RefreshToken::new(subject_id, &new_secret, device, now, self.validity);

        let rotated = self
            .repo
            .rotate(&JwtService::hash_secret(old_secret), subject_id, &replacement, now)
            .await
            .map_err(ServiceError::storage)?;

        if !rotated {
            tracing::warn!(subject_id = %subject_id, "Refresh token rotation rejected");
            return Err(ServiceError::RotationFailed);
        }

        Ok(new_secret)
    }

    pub async fn cleanup_expired(&self) -> Result<u64, ServiceError> {
        self.repo
            .delete_expired(self.clock.now())
            .await
            .map_err(ServiceError::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn store() -> (RefreshTokenStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let memory = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        (
            RefreshTokenStore::new(memory.clone(), clock.clone(), Duration::days(7)),
            memory,
            clock,
        )
    }

    #[tokio::test]
    async fn test_validate_rejects_expired_and_revoked() -> Result<(), anyhow::Error> {
        let (tokens, _, clock) = store();
        let subject = Uuid::new_v4();

        tokens.store(subject, "alpha", DeviceMetadata::default()).await?;
        tokens.store(subject, "beta", DeviceMetadata::default()).await?;
        assert!(tokens.validate("alpha").await?.is_some());
        assert!(tokens.validate("unknown").await?.is_none());

        assert!(tokens.revoke("beta").await?);
        assert!(tokens.revoke("beta").await?);
        assert!(tokens.validate("beta").await?.is_none());

        clock.advance(Duration::days(7));
        assert!(tokens.validate("alpha").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_rotation_replay_fails_and_keeps_successor() -> Result<(), anyhow::Error> {
        let (tokens, _, _) = store();
        let subject = Uuid::new_v4();
        tokens.store(subject, "secret-a", DeviceMetadata::default()).await?;

        let b = tokens.rotate("secret-a", subject, DeviceMetadata::default()).await?;
        assert!(tokens.validate("secret-a").await?.is_none());
        assert!(tokens.validate(&b).await?.is_some());

        let replay = tokens.rotate("secret-a", subject, DeviceMetadata::default()).await;
        assert!(matches!(replay, Err(ServiceError::RotationFailed)));
        assert!(tokens.validate(&b).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_rotation_requires_owner() -> Result<(), anyhow::Error> {
        let (tokens, _, _) = store();
        tokens.store(Uuid::new_v4(), "mine", DeviceMetadata::default()).await?;
        let stolen = tokens.rotate("mine", Uuid::new_v4(), DeviceMetadata::default()).await;
        assert!(matches!(stolen, Err(ServiceError::RotationFailed)));
        assert!(tokens.validate("mine").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_failure_fails_rotation() -> Result<(), anyhow::Error> {
        let (tokens, memory, _) = store();
        let subject = Uuid::new_v4();
        tokens.store(subject, "old", DeviceMetadata::default()).await?;

        memory.fail_refresh_token_writes(true)?;
        let result = tokens.rotate("old", subject, DeviceMetadata::default()).await;
        assert!(matches!(result, Err(ServiceError::Storage(_))));

        memory.fail_refresh_token_writes(false)?;
        assert!(tokens.validate("old").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_revoke_all_and_cleanup() -> Result<(), anyhow::Error> {
        let (tokens, _, clock) = store();
        let subject = Uuid::new_v4();
        for secret in ["one", "two", "three"] {
            tokens.store(subject, secret, DeviceMetadata::default()).await?;
        }
        tokens.store(Uuid::new_v4(), "other", DeviceMetadata::default()).await?;

        assert_eq!(tokens.revoke_all(subject).await?, 3);
        assert_eq!(tokens.revoke_all(subject).await?, 0);

        clock.advance(Duration::days(8));
        assert_eq!(tokens.cleanup_expired().await?, 4);
        Ok(())
    }
}
