use std::env;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::auth::responses::Role;
use crate::auth::{AuthError, AuthResult};

/// HS256 keys shorter than the digest size are rejected at startup.
pub const MIN_SECRET_LEN: usize = 32;

/// Upper bound for either token TTL: ten years.
pub const MAX_TOKEN_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> AuthResult<String> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AuthError::Config(format!("{key} is required")))
}

/// Administrator account created at startup when both email and password are set.
#[derive(Debug, Clone)]
pub struct SeedAdmin {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

/// Authentication configuration loaded from environment variables.
#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: Vec<u8>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub external_client_id: String,
    pub external_issuers: Vec<String>,
    pub external_jwks_url: String,
    pub external_timeout: Duration,
    pub external_leeway_secs: u64,
    pub store_timeout: Duration,
    pub default_role: Role,
    pub seed_admin: Option<SeedAdmin>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("external_client_id", &self.external_client_id)
            .field("external_issuers", &self.external_issuers)
            .field("external_jwks_url", &self.external_jwks_url)
            .field("external_timeout", &self.external_timeout)
            .field("external_leeway_secs", &self.external_leeway_secs)
            .field("store_timeout", &self.store_timeout)
            .field("default_role", &self.default_role)
            .field("seed_admin", &self.seed_admin.as_ref().map(|admin| &admin.email))
            .finish()
    }
}

impl AuthConfig {
    pub fn from_env() -> AuthResult<Self> {
        let jwt_secret = decode_secret(&env_required("AUTH_JWT_SECRET")?)?;
        let access_token_ttl_secs = env_i64("AUTH_ACCESS_TOKEN_TTL_SECS", 15 * 60);
        let refresh_token_ttl_secs = env_i64("AUTH_REFRESH_TOKEN_TTL_SECS", 7 * 24 * 60 * 60);
        let external_client_id = env_required("AUTH_GOOGLE_CLIENT_ID")?;
        let external_issuers = parse_list(&env_string("AUTH_GOOGLE_ISSUERS", &GOOGLE_ISSUERS.join(",")));
        let external_jwks_url = env_string("AUTH_GOOGLE_JWKS_URL", GOOGLE_JWKS_URL);
        let external_timeout = env_duration_millis("AUTH_EXTERNAL_TIMEOUT_MS", 5_000);
        let external_leeway_secs = env_i64("AUTH_EXTERNAL_LEEWAY_SECS", 60).max(0) as u64;
        let store_timeout = env_duration_millis("AUTH_STORE_TIMEOUT_MS", 5_000);
        let default_role = Role::from_str(&env_string("AUTH_DEFAULT_ROLE", Role::LEAST_PRIVILEGED.as_str()))
            .map_err(|err| AuthError::Config(format!("AUTH_DEFAULT_ROLE: {err}")))?;

        let seed_admin = match (
            env::var("AUTH_SEED_ADMIN_EMAIL").ok(),
            env::var("AUTH_SEED_ADMIN_PASSWORD").ok(),
        ) {
            (Some(email), Some(password)) => Some(SeedAdmin {
                full_name: env_string("AUTH_SEED_ADMIN_NAME", "Platform Administrator"),
                email,
                password,
            }),
            _ => None,
        };

        let config = Self {
            jwt_secret,
            access_token_ttl_secs,
            refresh_token_ttl_secs,
            external_client_id,
            external_issuers,
            external_jwks_url,
            external_timeout,
            external_leeway_secs,
            store_timeout,
            default_role,
            seed_admin,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuthResult<()> {
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Config(format!(
                "signing secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.access_token_ttl_secs <= 0 || self.refresh_token_ttl_secs <= 0 {
            return Err(AuthError::Config("token TTLs must be positive".into()));
        }
        if self.access_token_ttl_secs > MAX_TOKEN_TTL_SECS
            || self.refresh_token_ttl_secs > MAX_TOKEN_TTL_SECS
        {
            return Err(AuthError::Config(format!(
                "token TTLs must not exceed {MAX_TOKEN_TTL_SECS} seconds"
            )));
        }
        if self.refresh_token_ttl_secs <= self.access_token_ttl_secs {
            return Err(AuthError::Config(
                "refresh token TTL must exceed access token TTL".into(),
            ));
        }
        if self.external_issuers.is_empty() {
            return Err(AuthError::Config("at least one external issuer is required".into()));
        }
        Ok(())
    }
}

/// The signing secret is configured base64-encoded.
pub fn decode_secret(encoded: &str) -> AuthResult<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|err| AuthError::Config(format!("AUTH_JWT_SECRET is not valid base64: {err}")))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: vec![7u8; 32],
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 604_800,
            external_client_id: "client.apps.example".into(),
            external_issuers: GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            external_jwks_url: GOOGLE_JWKS_URL.into(),
            external_timeout: Duration::from_secs(5),
            external_leeway_secs: 60,
            store_timeout: Duration::from_secs(5),
            default_role: Role::Student,
            seed_admin: None,
        }
    }

    #[test]
    fn accepts_sane_defaults() {
        config().validate().expect("valid config");
    }

    #[test]
    fn rejects_short_secret_and_inverted_ttls() {
        let mut short = config();
        short.jwt_secret = b"too-short".to_vec();
        assert!(matches!(short.validate(), Err(AuthError::Config(_))));

        let mut inverted = config();
        inverted.refresh_token_ttl_secs = 60;
        assert!(matches!(inverted.validate(), Err(AuthError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_ttls() {
        let mut huge_refresh = config();
        huge_refresh.refresh_token_ttl_secs = 100_000_000_000_000;
        assert!(matches!(huge_refresh.validate(), Err(AuthError::Config(_))));

        let mut huge_both = config();
        huge_both.access_token_ttl_secs = i64::MAX - 1;
        huge_both.refresh_token_ttl_secs = i64::MAX;
        assert!(matches!(huge_both.validate(), Err(AuthError::Config(_))));

        let mut at_ceiling = config();
        at_ceiling.refresh_token_ttl_secs = MAX_TOKEN_TTL_SECS;
        at_ceiling.validate().expect("ceiling itself is allowed");
    }

    #[test]
    fn decodes_base64_secret() {
        let encoded = STANDARD.encode([1u8; 40]);
        assert_eq!(decode_secret(&encoded).unwrap().len(), 40);
        assert!(decode_secret("not base64!!").is_err());
    }

    #[test]
    fn splits_issuer_lists() {
        assert_eq!(
            parse_list(" a.example , ,https://b.example"),
            vec!["a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn debug_output_redacts_secret() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("[7, 7"));
    }
}
