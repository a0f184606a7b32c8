mod common;

use chrono::Duration;
use common::{TestContext, TEST_CLIENT_ID};
use identity_service::models::{AuditEventType, DeviceMetadata, VerifiedIdentity};
use identity_service::services::{ServiceError, TokenBlacklist};

fn google_identity(email: &str, provider_subject: &str) -> VerifiedIdentity {
    VerifiedIdentity {
        provider: "google".to_string(),
        provider_subject: provider_subject.to_string(),
        email: email.to_string(),
        display_name: Some("Pat Pantry".to_string()),
    }
}

#[tokio::test]
async fn test_refresh_rotates_and_detects_reuse() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let user = ctx.seed_subject("rotator@example.com").await;
    let origin = ctx.origin();

    let first = ctx.tokens_for(&user).await;
    let second = sessions
        .refresh(&first.refresh_token, DeviceMetadata::default(), &origin)
        .await?;
    assert_ne!(first.refresh_token, second.refresh_token);
    assert_ne!(first.access_token, second.access_token);

    let replay = sessions
        .refresh(&first.refresh_token, DeviceMetadata::default(), &origin)
        .await;
    assert!(matches!(replay, Err(ServiceError::Unauthorized(_))));

    // The legitimate successor still works.
    let third = sessions
        .refresh(&second.refresh_token, DeviceMetadata::default(), &origin)
        .await?;
    assert!(sessions.refresh_tokens().validate(&third.refresh_token).await?.is_some());

    let reuse_events: Vec<_> = ctx
        .store
        .audit_events()?
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::RefreshTokenReuse)
        .collect();
    assert_eq!(reuse_events.len(), 1);
    assert_eq!(reuse_events[0].subject_id, Some(user.subject_id));
    Ok(())
}

#[tokio::test]
async fn test_rotation_keeps_device_metadata() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let user = ctx.seed_subject("meta@example.com").await;
    let first = ctx.tokens_for(&user).await;

    let second = ctx
        .state
        .sessions
        .refresh(&first.refresh_token, DeviceMetadata::default(), &ctx.origin())
        .await?;

    let record = ctx
        .state
        .sessions
        .refresh_tokens()
        .validate(&second.refresh_token)
        .await?
        .expect("rotated token should be valid");
    assert_eq!(record.device.client_id.as_deref(), Some(TEST_CLIENT_ID));
    assert_eq!(record.device.ip_address.as_deref(), Some("198.51.100.20"));
    Ok(())
}

#[tokio::test]
async fn test_expired_refresh_token_is_unauthorized() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let user = ctx.seed_subject("expired@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    ctx.clock.advance(Duration::days(7));
    let result = ctx
        .state
        .sessions
        .refresh(&tokens.refresh_token, DeviceMetadata::default(), &ctx.origin())
        .await;
    assert!(matches!(result, Err(ServiceError::Unauthorized(_))));

    let unknown = ctx
        .state
        .sessions
        .refresh("never-issued", DeviceMetadata::default(), &ctx.origin())
        .await;
    assert!(matches!(unknown, Err(ServiceError::Unauthorized(_))));
    Ok(())
}

#[tokio::test]
async fn test_expired_credentials_are_audited() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let user = ctx.seed_subject("lapsed@example.com").await;
    let origin = ctx.origin();
    let tokens = ctx.tokens_for(&user).await;

    ctx.clock.advance(Duration::minutes(20));
    let access = sessions.authenticate(&tokens.access_token, &origin).await;
    assert!(matches!(access, Err(ServiceError::Unauthorized(_))));

    ctx.clock.advance(Duration::days(7));
    let refresh = sessions
        .refresh(&tokens.refresh_token, DeviceMetadata::default(), &origin)
        .await;
    assert!(matches!(refresh, Err(ServiceError::Unauthorized(_))));

    let rejections: Vec<_> = ctx
        .store
        .audit_events()?
        .into_iter()
        .filter(|e| {
            e.event_type == AuditEventType::AccessTokenRejected
                && e.subject_id == Some(user.subject_id)
        })
        .collect();
    assert_eq!(rejections.len(), 2);
    assert!(rejections.iter().all(|e| e.event_data["reason"] == "expired"));
    assert!(rejections
        .iter()
        .all(|e| e.ip_address.as_deref() == Some("198.51.100.20")));
    assert!(rejections
        .iter()
        .any(|e| e.event_data.get("token_id").is_some()));
    Ok(())
}

#[tokio::test]
async fn test_refresh_storage_failure_issues_nothing() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let user = ctx.seed_subject("flaky@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    ctx.store.fail_refresh_token_writes(true)?;
    let result = ctx
        .state
        .sessions
        .refresh(&tokens.refresh_token, DeviceMetadata::default(), &ctx.origin())
        .await;
    assert!(matches!(result, Err(ServiceError::Storage(_))));
    ctx.store.fail_refresh_token_writes(false)?;

    assert_eq!(ctx.store.refresh_tokens_for(user.subject_id)?.len(), 1);
    assert!(ctx
        .state
        .sessions
        .refresh_tokens()
        .validate(&tokens.refresh_token)
        .await?
        .is_some());
    Ok(())
}

#[tokio::test]
async fn test_logout_blacklists_access_token() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let user = ctx.seed_subject("leaver@example.com").await;
    let origin = ctx.origin();
    let tokens = ctx.tokens_for(&user).await;

    let claims = sessions.authenticate(&tokens.access_token, &origin).await?;
    sessions
        .logout(&claims, Some(&tokens.refresh_token), &origin)
        .await?;

    let rejected = sessions.authenticate(&tokens.access_token, &origin).await;
    assert!(matches!(rejected, Err(ServiceError::Unauthorized(_))));
    assert!(sessions
        .refresh_tokens()
        .validate(&tokens.refresh_token)
        .await?
        .is_none());

    assert!(ctx
        .store
        .audit_events()?
        .iter()
        .any(|e| e.event_type == AuditEventType::AccessTokenRejected
            && e.subject_id == Some(user.subject_id)));
    Ok(())
}

#[tokio::test]
async fn test_revoke_only_touches_own_tokens() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let alice = ctx.seed_subject("alice@example.com").await;
    let bob = ctx.seed_subject("bob@example.com").await;
    let origin = ctx.origin();

    let alice_tokens = ctx.tokens_for(&alice).await;
    let bob_tokens = ctx.tokens_for(&bob).await;
    let alice_claims = sessions.authenticate(&alice_tokens.access_token, &origin).await?;

    assert!(!sessions.revoke(&alice_claims, &bob_tokens.refresh_token, &origin).await?);
    assert!(sessions.refresh_tokens().validate(&bob_tokens.refresh_token).await?.is_some());

    assert!(sessions.revoke(&alice_claims, &alice_tokens.refresh_token, &origin).await?);
    assert!(sessions.refresh_tokens().validate(&alice_tokens.refresh_token).await?.is_none());

    // Revoking twice is harmless.
    assert!(sessions.revoke(&alice_claims, &alice_tokens.refresh_token, &origin).await?);
    Ok(())
}

#[tokio::test]
async fn test_revoke_all_counts_and_blacklists() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let user = ctx.seed_subject("everywhere@example.com").await;
    let origin = ctx.origin();

    let laptop = ctx.tokens_for(&user).await;
    let phone = ctx.tokens_for(&user).await;
    let cli = ctx.tokens_for(&user).await;

    let claims = sessions.authenticate(&laptop.access_token, &origin).await?;
    assert_eq!(sessions.revoke_all(&claims, &origin).await?, 3);

    for secret in [&laptop.refresh_token, &phone.refresh_token, &cli.refresh_token] {
        assert!(sessions.refresh_tokens().validate(secret).await?.is_none());
    }
    assert!(sessions.authenticate(&laptop.access_token, &origin).await.is_err());
    // Other access tokens stay valid until they expire.
    assert!(sessions.authenticate(&phone.access_token, &origin).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_blacklist_entry_expires_with_token() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let user = ctx.seed_subject("ttl@example.com").await;
    let origin = ctx.origin();
    let tokens = ctx.tokens_for(&user).await;

    let claims = sessions.authenticate(&tokens.access_token, &origin).await?;
    sessions.logout(&claims, None, &origin).await?;

    assert!(ctx.blacklist.is_blacklisted(&claims.jti).await?);
    ctx.clock.advance(Duration::minutes(15));
    assert!(!ctx.blacklist.is_blacklisted(&claims.jti).await?);

    let expired = sessions.authenticate(&tokens.access_token, &origin).await;
    assert!(matches!(expired, Err(ServiceError::Unauthorized(_))));
    Ok(())
}

#[tokio::test]
async fn test_blacklist_outage_fails_closed() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let user = ctx.seed_subject("outage@example.com").await;
    let tokens = ctx.tokens_for(&user).await;

    ctx.blacklist.set_unavailable(true);
    let result = ctx
        .state
        .sessions
        .authenticate(&tokens.access_token, &ctx.origin())
        .await;
    assert!(matches!(result, Err(ServiceError::Unauthorized(_))));

    ctx.blacklist.set_unavailable(false);
    assert!(ctx
        .state
        .sessions
        .authenticate(&tokens.access_token, &ctx.origin())
        .await
        .is_ok());
    Ok(())
}

#[tokio::test]
async fn test_provider_sign_in_creates_then_reuses_subject() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let sessions = &ctx.state.sessions;
    let origin = ctx.origin();

    let first = sessions
        .sign_in_with_provider(
            google_identity("New.User@Example.com", "g-123"),
            DeviceMetadata::default(),
            &origin,
        )
        .await?;
    let claims = sessions.authenticate(&first.access_token, &origin).await?;
    assert_eq!(claims.email, "new.user@example.com");
    let subject_id = claims.subject_id()?;
    assert_eq!(ctx.store.identity_links_for(subject_id)?.len(), 1);

    let second = sessions
        .sign_in_with_provider(
            google_identity("new.user@example.com", "g-123"),
            DeviceMetadata::default(),
            &origin,
        )
        .await?;
    let again = sessions.authenticate(&second.access_token, &origin).await?;
    assert_eq!(again.sub, claims.sub);
    assert_eq!(ctx.store.identity_links_for(subject_id)?.len(), 1);

    let created = ctx
        .store
        .audit_events()?
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::SubjectCreated)
        .count();
    assert_eq!(created, 1);
    Ok(())
}

#[tokio::test]
async fn test_provider_sign_in_links_existing_email() -> Result<(), anyhow::Error> {
    let ctx = TestContext::new();
    let existing = ctx.seed_subject("shared@example.com").await;
    let household = ctx.seed_household(&[&existing]);

    let tokens = ctx
        .state
        .sessions
        .sign_in_with_provider(
            google_identity("shared@example.com", "g-999"),
            DeviceMetadata::default(),
            &ctx.origin(),
        )
        .await?;
    let claims = ctx
        .state
        .sessions
        .authenticate(&tokens.access_token, &ctx.origin())
        .await?;
    assert_eq!(claims.sub, existing.subject_id.to_string());
    assert_eq!(claims.household_id, Some(household.household_id.to_string()));
    assert_eq!(claims.role.as_deref(), Some("owner"));
    assert_eq!(ctx.store.identity_links_for(existing.subject_id)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_incomplete_identity_is_rejected() {
    let ctx = TestContext::new();
    let result = ctx
        .state
        .sessions
        .sign_in_with_provider(
            google_identity("not-an-email", "g-1"),
            DeviceMetadata::default(),
            &ctx.origin(),
        )
        .await;
    assert!(matches!(result, Err(ServiceError::InvalidInput(_))));
}
