use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;

/// Denylist of access-token ids. Entries live only as long as the token
/// they reject would have.
#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    async fn blacklist_token(
        &self,
        token_jti: &str,
        expiry_seconds: i64,
    ) -> Result<(), anyhow::Error>;
    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

fn blacklist_key(token_jti: &str) -> String {
    format!("blacklist:{}", token_jti)
}

#[async_trait]
impl TokenBlacklist for RedisService {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }

    /// Add a token to the blacklist with an expiry
    async fn blacklist_token(
        &self,
        token_jti: &str,
        expiry_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        // Redis rejects EX 0
        if expiry_seconds <= 0 {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(blacklist_key(token_jti))
            .arg("revoked")
            .arg("EX")
            .arg(expiry_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to blacklist token: {}", e))
    }

    /// Check if a token is in the blacklist
    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(blacklist_key(token_jti))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check blacklist: {}", e))?;

        Ok(exists)
    }
}

/// Process-local blacklist that honours TTLs against the injected clock.
pub struct InMemoryBlacklist {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl InMemoryBlacklist {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate a backend outage: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Blacklist backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenBlacklist for InMemoryBlacklist {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        self.check_available()
    }

    async fn blacklist_token(
        &self,
        token_jti: &str,
        expiry_seconds: i64,
    ) -> Result<(), anyhow::Error> {
        self.check_available()?;
        if expiry_seconds <= 0 {
            return Ok(());
        }
        let expires_at = self.clock.now() + Duration::seconds(expiry_seconds);
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Blacklist mutex poisoned: {}", e))?;
        let now = self.clock.now();
        entries.retain(|_, at| *at > now);
        entries.insert(token_jti.to_string(), expires_at);
        Ok(())
    }

    async fn is_blacklisted(&self, token_jti: &str) -> Result<bool, anyhow::Error> {
        self.check_available()?;
        let now = self.clock.now();
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Blacklist mutex poisoned: {}", e))?;
        Ok(entries.get(token_jti).map(|at| *at > now).unwrap_or(false))
    }
}
