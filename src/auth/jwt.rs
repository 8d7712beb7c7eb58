//! Self-contained HS256 session credentials.
//!
//! Verification needs only the signing key, never the store. The price is that a
//! token's `role` claim stays authoritative until the token expires: a role
//! change on the identity takes effect at the next issuance (login or refresh),
//! and access tokens are kept short-lived to bound that window.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::responses::Role;
use crate::auth::{AuthConfig, AuthError, AuthResult};
use crate::store::Identity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Email of the identity.
    pub sub: String,
    pub uid: i64,
    /// Present on access tokens only; refresh never trusts a role from the token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Access and refresh tokens minted together from one identity snapshot.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: SignedToken,
    pub refresh: SignedToken,
}

pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl TokenService {
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        config.validate()?;

        let encoding_key = EncodingKey::from_secret(&config.jwt_secret);
        let decoding_key = DecodingKey::from_secret(&config.jwt_secret);

        // Expiry is checked by hand after the signature so the two failures stay distinct.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims =
            HashSet::from(["exp".to_string(), "sub".to_string()]);

        Ok(Self {
            encoding_key,
            decoding_key,
            validation,
            access_token_ttl: Duration::seconds(config.access_token_ttl_secs),
            refresh_token_ttl: Duration::seconds(config.refresh_token_ttl_secs),
        })
    }

    pub fn issue_access_token(&self, user_id: i64, email: &str, role: Role) -> AuthResult<SignedToken> {
        self.issue_access_token_at(user_id, email, role, Utc::now())
    }

    pub fn issue_access_token_at(
        &self,
        user_id: i64,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> AuthResult<SignedToken> {
        self.sign(user_id, email, Some(role), TokenKind::Access, now, self.access_token_ttl)
    }

    pub fn issue_refresh_token(&self, user_id: i64, email: &str) -> AuthResult<SignedToken> {
        self.issue_refresh_token_at(user_id, email, Utc::now())
    }

    pub fn issue_refresh_token_at(
        &self,
        user_id: i64,
        email: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<SignedToken> {
        self.sign(user_id, email, None, TokenKind::Refresh, now, self.refresh_token_ttl)
    }

    /// The only way the service hands out credentials: both tokens, same instant.
    pub fn issue_pair(&self, identity: &Identity) -> AuthResult<TokenPair> {
        let now = Utc::now();
        Ok(TokenPair {
            access: self.issue_access_token_at(identity.id, &identity.email, identity.role, now)?,
            refresh: self.issue_refresh_token_at(identity.id, &identity.email, now)?,
        })
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        self.verify_at(token, Utc::now())
    }

    /// Signature first, expiry second. Anything that fails to decode, including
    /// a malformed token or an unexpected algorithm, is `InvalidSignature`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> AuthResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|err| {
            log::debug!("token rejected: {:?}", err.kind());
            AuthError::InvalidSignature
        })?;

        if now.timestamp() >= data.claims.exp {
            return Err(AuthError::ExpiredToken);
        }

        Ok(data.claims)
    }

    /// True when `token` verifies, has not expired and was issued to `expected_email`.
    pub fn is_valid_for(&self, token: &str, expected_email: &str) -> bool {
        self.verify(token)
            .map(|claims| claims.sub == expected_email)
            .unwrap_or(false)
    }

    fn sign(
        &self,
        user_id: i64,
        email: &str,
        role: Option<Role>,
        kind: TokenKind,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> AuthResult<SignedToken> {
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::Config("token expiry is out of range".into()))?;
        let claims = Claims {
            sub: email.to_string(),
            uid: user_id,
            role,
            typ: kind,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(SignedToken { token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_auth_config;

    fn service() -> TokenService {
        TokenService::from_config(&test_auth_config()).expect("token service")
    }

    #[test]
    fn issues_and_verifies_access_tokens() {
        let service = service();
        let token = service
            .issue_access_token(42, "user@example.com", Role::Instructor)
            .expect("issue token");

        let claims = service.verify(&token.token).expect("verify token");

        assert_eq!(claims.sub, "user@example.com");
        assert_eq!(claims.uid, 42);
        assert_eq!(claims.role, Some(Role::Instructor));
        assert_eq!(claims.typ, TokenKind::Access);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn refresh_tokens_carry_no_role() {
        let service = service();
        let token = service
            .issue_refresh_token(7, "user@example.com")
            .expect("issue token");
        let claims = service.verify(&token.token).expect("verify token");

        assert_eq!(claims.role, None);
        assert_eq!(claims.typ, TokenKind::Refresh);
        assert_eq!(claims.exp - claims.iat, 604_800);
    }

    #[test]
    fn access_token_expires_after_ttl() {
        let service = service();
        let issued_at = Utc::now();
        let token = service
            .issue_access_token_at(1, "a@b.c", Role::Student, issued_at)
            .expect("issue token");

        assert!(service.verify_at(&token.token, issued_at).is_ok());
        assert!(
            service
                .verify_at(&token.token, issued_at + Duration::seconds(899))
                .is_ok()
        );
        assert!(matches!(
            service.verify_at(&token.token, issued_at + Duration::seconds(901)),
            Err(AuthError::ExpiredToken)
        ));
    }

    #[test]
    fn foreign_key_is_invalid_signature_even_when_expired() {
        let mut other_config = test_auth_config();
        other_config.jwt_secret = vec![0x42; 32];
        let other = TokenService::from_config(&other_config).expect("other service");
        let service = service();

        let long_ago = Utc::now() - Duration::days(30);
        let stale = other
            .issue_access_token_at(1, "a@b.c", Role::Admin, long_ago)
            .expect("issue token");
        let fresh = other
            .issue_access_token(1, "a@b.c", Role::Admin)
            .expect("issue token");

        assert!(matches!(service.verify(&stale.token), Err(AuthError::InvalidSignature)));
        assert!(matches!(service.verify(&fresh.token), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn tampered_and_garbage_tokens_fail_closed() {
        let service = service();
        let token = service
            .issue_access_token(1, "a@b.c", Role::Student)
            .expect("issue token");

        let mut parts: Vec<&str> = token.token.split('.').collect();
        let forged_claims = {
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(
                serde_json::json!({
                    "sub": "a@b.c", "uid": 1, "role": "ADMIN", "typ": "access",
                    "iat": 0, "exp": i64::MAX / 2, "jti": "x"
                })
                .to_string(),
            )
        };
        parts[1] = forged_claims.as_str();
        let forged = parts.join(".");

        assert!(matches!(service.verify(&forged), Err(AuthError::InvalidSignature)));
        assert!(matches!(service.verify("not.a.jwt"), Err(AuthError::InvalidSignature)));
        assert!(matches!(service.verify(""), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn is_valid_for_checks_subject_and_expiry() {
        let service = service();
        let token = service
            .issue_access_token(3, "ada@x.com", Role::Student)
            .expect("issue token");
        assert!(service.is_valid_for(&token.token, "ada@x.com"));
        assert!(!service.is_valid_for(&token.token, "eve@x.com"));

        let expired = service
            .issue_access_token_at(3, "ada@x.com", Role::Student, Utc::now() - Duration::hours(1))
            .expect("issue token");
        assert!(!service.is_valid_for(&expired.token, "ada@x.com"));
    }

    #[test]
    fn out_of_range_ttl_is_a_config_error_not_a_panic() {
        let mut config = test_auth_config();
        config.refresh_token_ttl_secs = 100_000_000_000_000;
        assert!(matches!(
            TokenService::from_config(&config),
            Err(AuthError::Config(_))
        ));

        let service = service();
        let result = service.issue_refresh_token_at(1, "a@b.c", DateTime::<Utc>::MAX_UTC);
        assert!(matches!(result, Err(AuthError::Config(_))));
    }
}
