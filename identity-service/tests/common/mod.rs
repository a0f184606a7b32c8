//! Test helpers for identity-service integration tests.
//!
//! Everything runs against the in-memory store, the in-memory blacklist and a
//! manual clock, so tests control time and can inject storage failures.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response},
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use identity_service::{
    build_router,
    clock::{Clock, ManualClock},
    config::{
        AccountConfig, AuditConfig, BlacklistBackend, DatabaseConfig, DeviceFlowConfig,
        Environment, IdentityConfig, JwtConfig, JwtKeys, MaintenanceConfig, RedisConfig,
        StorageBackend,
    },
    models::{
        DeviceMetadata, Household, HouseholdInvite, HouseholdMember, HouseholdRole, RequestOrigin,
        Subject,
    },
    services::{InMemoryBlacklist, IssueSource, JwtService, TokenBlacklist, TokenResponse},
    store::{AccountRepository, MemoryStore, Stores},
    AppState,
};
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_CLIENT_ID: &str = "inventory-cli";
pub const TEST_JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn test_config() -> IdentityConfig {
    IdentityConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "identity-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        trust_proxy_headers: false,
        storage: StorageBackend::Memory,
        database: DatabaseConfig {
            url: "postgres://localhost/identity_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        },
        blacklist: BlacklistBackend::Memory,
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        jwt: JwtConfig {
            keys: JwtKeys::Secret(TEST_JWT_SECRET.to_string()),
            issuer: "identity-service".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        device: DeviceFlowConfig {
            allowed_client_ids: vec![TEST_CLIENT_ID.to_string()],
            verification_uri: "https://pantry.example.com/device".to_string(),
            code_expiry_seconds: 900,
            poll_interval_seconds: 5,
        },
        account: AccountConfig {
            deletion_grace_days: 30,
        },
        audit: AuditConfig { retention_days: 90 },
        maintenance: MaintenanceConfig {
            interval_seconds: 3600,
        },
    }
}

pub struct TestContext {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub blacklist: Arc<InMemoryBlacklist>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: IdentityConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(MemoryStore::new());
        let blacklist = Arc::new(InMemoryBlacklist::new(dyn_clock.clone()));

        let jwt = JwtService::new(&config.jwt, dyn_clock.clone()).expect("Failed to create JWT service");
        let state = AppState::new(
            config,
            Stores::memory(store.clone()),
            blacklist.clone() as Arc<dyn TokenBlacklist>,
            jwt,
            dyn_clock,
        );

        Self {
            state,
            store,
            blacklist,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn origin(&self) -> RequestOrigin {
        RequestOrigin::new("198.51.100.20", Some("pantry-tests/1.0".to_string()))
    }

    pub async fn router(&self) -> Router {
        build_router(self.state.clone())
            .await
            .expect("Failed to build router")
    }

    pub async fn seed_subject(&self, email: &str) -> Subject {
        let subject = Subject::new(email, Some(email.to_string()), self.now());
        self.store
            .insert_subject(&subject)
            .await
            .expect("Failed to insert subject");
        subject
    }

    pub async fn subject(&self, subject_id: Uuid) -> Option<Subject> {
        self.store
            .find_subject(subject_id)
            .await
            .expect("Failed to read subject")
    }

    /// Household owned by the first subject; the rest join one day apart.
    pub fn seed_household(&self, subjects: &[&Subject]) -> Household {
        let household = Household {
            household_id: Uuid::new_v4(),
            household_name: "Test Pantry".to_string(),
            owner_subject_id: subjects[0].subject_id,
            created_utc: self.now(),
        };
        let members = subjects
            .iter()
            .enumerate()
            .map(|(i, subject)| HouseholdMember {
                household_id: household.household_id,
                subject_id: subject.subject_id,
                role: if i == 0 {
                    HouseholdRole::Owner
                } else {
                    HouseholdRole::Member
                },
                joined_utc: self.now() + Duration::days(i as i64),
            })
            .collect();
        let invites = vec![HouseholdInvite {
            invite_code: format!("INV-{}", &household.household_id.simple().to_string()[..8]),
            household_id: household.household_id,
            expiry_utc: self.now() + Duration::days(7),
            used: false,
        }];
        self.store
            .insert_household(household.clone(), members, invites)
            .expect("Failed to seed household");
        household
    }

    pub async fn tokens_for(&self, subject: &Subject) -> TokenResponse {
        self.state
            .sessions
            .issue_for_subject(
                subject.subject_id,
                DeviceMetadata::for_client(TEST_CLIENT_ID),
                IssueSource::SignIn,
            )
            .await
            .expect("Failed to issue tokens")
    }
}

pub fn form_request(uri: &str, body: &[(&str, &str)]) -> Request<Body> {
    let encoded = serde_urlencoded::to_string(body).expect("Failed to encode form");
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(encoded))
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, bearer: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn bearer_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}
