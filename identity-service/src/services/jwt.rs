use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{JwtConfig, JwtKeys};
use crate::models::{HouseholdRole, RefreshToken};
use crate::services::error::TokenError;

/// Bytes of entropy in a refresh secret.
const REFRESH_SECRET_BYTES: usize = 32;

/// JWT service for access token issuance and verification.
///
/// Key material is loaded once and never reloaded.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_token_expiry_minutes: i64,
    clock: Arc<dyn Clock>,
}

/// Claims for access tokens (short-lived)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject ID
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub household_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// JWT ID (for blacklisting)
    pub jti: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl AccessTokenClaims {
    pub fn subject_id(&self) -> Result<Uuid, TokenError> {
        Uuid::parse_str(&self.sub).map_err(|e| TokenError::Malformed(e.to_string()))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.exp, 0).single()
    }
}

/// Who a token pair is minted for.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSubject {
    pub subject_id: Uuid,
    pub email: String,
    pub household_id: Option<Uuid>,
    pub role: Option<HouseholdRole>,
}

/// A freshly signed access token plus an unsigned refresh secret.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_secret: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub jti: String,
}

impl JwtService {
    /// Load signing keys as configured: RS256 from PEM files or HS256 from a secret.
    pub fn new(config: &JwtConfig, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        match &config.keys {
            JwtKeys::Rsa {
                private_key_path,
                public_key_path,
            } => {
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read private key from {}: {}", private_key_path, e)
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                tracing::info!("JWT service initialized with RS256 keys");
                Ok(Self {
                    encoding_key,
                    decoding_key,
                    algorithm: Algorithm::RS256,
                    issuer: config.issuer.clone(),
                    access_token_expiry_minutes: config.access_token_expiry_minutes,
                    clock,
                })
            }
            JwtKeys::Secret(secret) => {
                tracing::info!("JWT service initialized with HS256 secret");
                Ok(Self::from_secret(
                    secret.as_bytes(),
                    &config.issuer,
                    config.access_token_expiry_minutes,
                    clock,
                ))
            }
        }
    }

    pub fn from_secret(
        secret: &[u8],
        issuer: &str,
        access_token_expiry_minutes: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
            issuer: issuer.to_string(),
            access_token_expiry_minutes,
            clock,
        }
    }

    /// Mint an access token and a new refresh secret.
    pub fn issue(&self, subject: &TokenSubject) -> Result<IssuedCredentials, TokenError> {
        let (access_token, claims) = self.issue_access_token(subject)?;
        Ok(IssuedCredentials {
            access_token,
            refresh_secret: Self::generate_refresh_secret(),
            token_type: "Bearer",
            expires_in: self.access_token_expiry_seconds(),
            jti: claims.jti,
        })
    }

    /// Sign an access token with a fresh jti.
    pub fn issue_access_token(
        &self,
        subject: &TokenSubject,
    ) -> Result<(String, AccessTokenClaims), TokenError> {
        let now = self.clock.now();
        let exp = now + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: subject.subject_id.to_string(),
            email: subject.email.clone(),
            household_id: subject.household_id.map(|id| id.to_string()),
            role: subject.role.map(|r| r.as_str().to_string()),
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok((token, claims))
    }

    /// Check signature, issuer and expiry. Expiry is judged by the injected clock.
    pub fn verify(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);

        let token_data =
            decode::<AccessTokenClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                    _ => TokenError::Malformed(e.to_string()),
                }
            })?;

        if token_data.claims.exp <= self.clock.now().timestamp() {
            return Err(TokenError::Expired {
                subject: token_data.claims.subject_id().ok(),
            });
        }

        Ok(token_data.claims)
    }

    /// Seconds until `claims` expires, never negative.
    pub fn remaining_lifetime_seconds(&self, claims: &AccessTokenClaims) -> i64 {
        (claims.exp - self.clock.now().timestamp()).max(0)
    }

    /// 256 bits from the OS-seeded thread RNG, base64url without padding.
    pub fn generate_refresh_secret() -> String {
        let mut bytes = [0u8; REFRESH_SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn hash_secret(secret: &str) -> String {
        RefreshToken::hash_token(secret)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service(clock: Arc<ManualClock>) -> JwtService {
        JwtService::from_secret(b"unit-test-secret", "identity-test", 15, clock)
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            subject_id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            household_id: Some(Uuid::new_v4()),
            role: Some(HouseholdRole::Owner),
        }
    }

    #[test]
    fn test_issue_and_verify() -> Result<(), anyhow::Error> {
        let clock = Arc::new(ManualClock::default());
        let jwt = service(clock);
        let subject = subject();

        let issued = jwt.issue(&subject)?;
        assert_eq!(issued.token_type, "Bearer");
        assert_eq!(issued.expires_in, 900);

        let claims = jwt.verify(&issued.access_token)?;
        assert_eq!(claims.subject_id()?, subject.subject_id);
        assert_eq!(claims.role.as_deref(), Some("owner"));
        assert_eq!(claims.jti, issued.jti);
        Ok(())
    }

    #[test]
    fn test_each_token_gets_fresh_jti() -> Result<(), anyhow::Error> {
        let jwt = service(Arc::new(ManualClock::default()));
        let subject = subject();
        let a = jwt.issue(&subject)?;
        let b = jwt.issue(&subject)?;
        assert_ne!(a.jti, b.jti);
        assert_ne!(a.refresh_secret, b.refresh_secret);
        Ok(())
    }

    #[test]
    fn test_expiry_follows_clock() -> Result<(), anyhow::Error> {
        let clock = Arc::new(ManualClock::default());
        let jwt = service(clock.clone());
        let subject = subject();
        let issued = jwt.issue(&subject)?;

        clock.advance(Duration::minutes(14));
        assert!(jwt.verify(&issued.access_token).is_ok());

        clock.advance(Duration::minutes(1));
        assert!(matches!(
            jwt.verify(&issued.access_token),
            Err(TokenError::Expired { subject: Some(id) }) if id == subject.subject_id
        ));
        Ok(())
    }

    #[test]
    fn test_wrong_key_is_invalid_signature() -> Result<(), anyhow::Error> {
        let clock = Arc::new(ManualClock::default());
        let issuer = service(clock.clone());
        let other = JwtService::from_secret(b"another-secret", "identity-test", 15, clock);

        let issued = issuer.issue(&subject())?;
        assert!(matches!(
            other.verify(&issued.access_token),
            Err(TokenError::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn test_garbage_is_malformed() {
        let jwt = service(Arc::new(ManualClock::default()));
        assert!(matches!(jwt.verify("not-a-jwt"), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_refresh_secret_shape() {
        let secret = JwtService::generate_refresh_secret();
        // 32 bytes -> 43 base64url chars without padding
        assert_eq!(secret.len(), 43);
        assert_eq!(JwtService::hash_secret(&secret), JwtService::hash_secret(&secret));
        assert_ne!(JwtService::hash_secret(&secret), secret);
    }
}
