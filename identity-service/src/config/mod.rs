use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Take the client address from `x-forwarded-for`. Only safe behind a
    /// proxy that overwrites the header.
    pub trust_proxy_headers: bool,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub blacklist: BlacklistBackend,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub device: DeviceFlowConfig,
    pub account: AccountConfig,
    pub audit: AuditConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Signing material: an RSA key pair on disk, or a shared secret.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub enum JwtKeys {
    Rsa {
        private_key_path: String,
        public_key_path: String,
    },
    Secret(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub keys: JwtKeys,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceFlowConfig {
    pub allowed_client_ids: Vec<String>,
    pub verification_uri: String,
    pub code_expiry_seconds: i64,
    pub poll_interval_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub deletion_grace_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let otlp_endpoint = env::var("OTLP_ENDPOINT")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| common_config.otlp_endpoint.clone());

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint,
            trust_proxy_headers: parse_env("TRUST_PROXY_HEADERS", "false", is_prod)?,
            storage: parse_env("STORAGE_BACKEND", "postgres", is_prod)?,
            database: DatabaseConfig {
                url: get_env(
                    "DATABASE_URL",
                    Some("postgres://localhost/identity"),
                    is_prod,
                )?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            blacklist: parse_env("BLACKLIST_BACKEND", "redis", is_prod)?,
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                keys: jwt_keys_from_env()?,
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env("JWT_REFRESH_TOKEN_EXPIRY_DAYS", "7", is_prod)?,
            },
            device: DeviceFlowConfig {
                allowed_client_ids: get_env("DEVICE_ALLOWED_CLIENT_IDS", Some("inventory-cli"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                verification_uri: get_env(
                    "DEVICE_VERIFICATION_URI",
                    Some("http://localhost:3000/device"),
                    is_prod,
                )?,
                code_expiry_seconds: parse_env("DEVICE_CODE_EXPIRY_SECONDS", "900", is_prod)?,
                poll_interval_seconds: parse_env("DEVICE_POLL_INTERVAL_SECONDS", "5", is_prod)?,
            },
            account: AccountConfig {
                deletion_grace_days: parse_env("ACCOUNT_DELETION_GRACE_DAYS", "30", is_prod)?,
            },
            audit: AuditConfig {
                retention_days: parse_env("AUDIT_RETENTION_DAYS", "90", is_prod)?,
            },
            maintenance: MaintenanceConfig {
                interval_seconds: parse_env("MAINTENANCE_INTERVAL_SECONDS", "3600", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(config_error("PORT must be greater than 0"));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(config_error("JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(config_error("JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"));
        }

        if let JwtKeys::Secret(secret) = &self.jwt.keys {
            if secret.is_empty() {
                return Err(config_error("JWT_SECRET must not be empty"));
            }
        }

        if self.device.allowed_client_ids.is_empty() {
            return Err(config_error("DEVICE_ALLOWED_CLIENT_IDS must list at least one client"));
        }

        if self.device.code_expiry_seconds <= 0 || self.device.poll_interval_seconds <= 0 {
            return Err(config_error(
                "DEVICE_CODE_EXPIRY_SECONDS and DEVICE_POLL_INTERVAL_SECONDS must be positive",
            ));
        }

        if self.account.deletion_grace_days <= 0 {
            return Err(config_error("ACCOUNT_DELETION_GRACE_DAYS must be positive"));
        }

        if self.audit.retention_days <= 0 {
            return Err(config_error("AUDIT_RETENTION_DAYS must be positive"));
        }

        if self.maintenance.interval_seconds == 0 {
            return Err(config_error("MAINTENANCE_INTERVAL_SECONDS must be positive"));
        }

        if self.environment == Environment::Prod {
            if self.storage == StorageBackend::Memory || self.blacklist == BlacklistBackend::Memory {
                tracing::error!("In-memory storage in production loses all sessions on restart");
            }
            if matches!(self.jwt.keys, JwtKeys::Secret(_)) {
                tracing::warn!("Using a shared JWT secret in production; prefer an RSA key pair");
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message.to_string()))
}

/// RSA key paths win when both are set; otherwise `JWT_SECRET` is required.
fn jwt_keys_from_env() -> Result<JwtKeys, AppError> {
    let private_key_path = env::var("JWT_PRIVATE_KEY_PATH").ok();
    let public_key_path = env::var("JWT_PUBLIC_KEY_PATH").ok();

    match (private_key_path, public_key_path) {
        (Some(private_key_path), Some(public_key_path)) => Ok(JwtKeys::Rsa {
            private_key_path,
            public_key_path,
        }),
        (Some(_), None) | (None, Some(_)) => Err(config_error(
            "JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH must be set together",
        )),
        (None, None) => env::var("JWT_SECRET").map(JwtKeys::Secret).map_err(|_| {
            config_error("Either JWT_PRIVATE_KEY_PATH/JWT_PUBLIC_KEY_PATH or JWT_SECRET must be set")
        }),
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

impl FromStr for BlacklistBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(BlacklistBackend::Redis),
            "memory" => Ok(BlacklistBackend::Memory),
            _ => Err(format!("Invalid blacklist backend: {}", s)),
        }
    }
}
