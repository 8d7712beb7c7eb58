//! Verification of third-party identity assertions (Google ID tokens).
//!
//! Callers only ever learn "valid identity" or "not valid": every validation
//! failure is logged here and collapsed to `None`. The one failure that is
//! reported is an unreachable key source, which is transient.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use log::{debug, error, warn};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::CACHE_CONTROL;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::{AuthConfig, AuthError, AuthResult};

const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(60 * 60);
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Identity asserted by the external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[rocket::async_trait]
pub trait ExternalIdentityVerifier: Send + Sync {
    /// `Ok(None)` for any invalid assertion; `Err` only for
    /// [`AuthError::VerifierUnavailable`].
    async fn verify(&self, assertion: &str) -> AuthResult<Option<ExternalIdentity>>;
}

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("key source HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("key source returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("key source request timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to decode key set: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A key set plus how long the source says it may be cached.
#[derive(Debug, Clone)]
pub struct FetchedJwks {
    pub keys: JwkSet,
    pub max_age: Option<Duration>,
}

#[rocket::async_trait]
pub trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<FetchedJwks, JwksError>;
}

/// Fetches the issuer's published key set over HTTPS.
pub struct HttpJwksSource {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpJwksSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, JwksError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent("auth-server/0.1")
            .build()?;

        Ok(Self {
            http,
            url: url.into(),
            timeout,
        })
    }
}

#[rocket::async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<FetchedJwks, JwksError> {
        debug!("jwks: fetching keys from {}", self.url);

        let response = tokio::time::timeout(self.timeout, self.http.get(&self.url).send())
            .await
            .map_err(|_| JwksError::Timeout(self.timeout))??;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(JwksError::Status { status, body });
        }

        let max_age = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age);

        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| JwksError::Timeout(self.timeout))??;
        let keys: JwkSet = serde_json::from_slice(&body)?;

        Ok(FetchedJwks { keys, max_age })
    }
}

/// Fixed key set, for deployments with pinned keys and for tests.
pub struct StaticJwksSource {
    keys: JwkSet,
}

impl StaticJwksSource {
    pub fn new(keys: JwkSet) -> Self {
        Self { keys }
    }
}

#[rocket::async_trait]
impl JwksSource for StaticJwksSource {
    async fn fetch(&self) -> Result<FetchedJwks, JwksError> {
        Ok(FetchedJwks {
            keys: self.keys.clone(),
            max_age: None,
        })
    }
}

fn parse_max_age(header: &str) -> Option<Duration> {
    header.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("max-age") {
            value.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedKeys {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

/// Caches the issuer's keys and refetches when they go stale or an unknown
/// `kid` shows up (key rotation). Refetches are serialized and rate-limited.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    cached: RwLock<Option<CachedKeys>>,
    refresh: tokio::sync::Mutex<()>,
    min_refresh_interval: Duration,
}

impl JwksCache {
    pub fn new(source: Arc<dyn JwksSource>) -> Self {
        Self::with_refresh_interval(source, MIN_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(source: Arc<dyn JwksSource>, min_refresh_interval: Duration) -> Self {
        Self {
            source,
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
            min_refresh_interval,
        }
    }

    /// `Ok(None)` when the key set is reachable but has no key with `kid`.
    pub async fn decoding_key(&self, kid: &str) -> Result<Option<DecodingKey>, JwksError> {
        if let Some(key) = self.cached_key(kid, true) {
            return Ok(Some(key));
        }

        let _refresh = self.refresh.lock().await;

        // Another task may have refreshed while this one waited.
        if let Some(key) = self.cached_key(kid, true) {
            return Ok(Some(key));
        }
        if !self.may_refetch() {
            return Ok(None);
        }

        match self.source.fetch().await {
            Ok(fetched) => {
                debug!("jwks: cached {} keys", fetched.keys.keys.len());
                *self.cached.write() = Some(CachedKeys {
                    keys: fetched.keys,
                    fetched_at: Instant::now(),
                    ttl: fetched.max_age.unwrap_or(DEFAULT_KEYS_TTL),
                });
                Ok(self.cached_key(kid, false))
            }
            Err(err) => match self.cached_key(kid, false) {
                Some(key) => {
                    warn!("jwks: refresh failed, using stale keys: {}", err);
                    Ok(Some(key))
                }
                None => Err(err),
            },
        }
    }

    fn cached_key(&self, kid: &str, require_fresh: bool) -> Option<DecodingKey> {
        let guard = self.cached.read();
        let cached = guard.as_ref()?;
        if require_fresh && !cached.is_fresh() {
            return None;
        }
        let jwk = cached.keys.find(kid)?;
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!("jwks: key {} is unusable: {}", kid, err);
                None
            }
        }
    }

    fn may_refetch(&self) -> bool {
        match self.cached.read().as_ref() {
            None => true,
            Some(cached) => {
                !cached.is_fresh() || cached.fetched_at.elapsed() >= self.min_refresh_interval
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmailVerified {
    Flag(bool),
    Text(String),
}

impl EmailVerified {
    fn is_verified(&self) -> bool {
        match self {
            EmailVerified::Flag(flag) => *flag,
            EmailVerified::Text(text) => text.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<EmailVerified>,
    #[serde(default)]
    name: Option<String>,
}

/// Validates Google-issued ID tokens: RS256 signature against the issuer's
/// published keys, audience, issuer, and expiry.
pub struct GoogleIdTokenVerifier {
    keys: JwksCache,
    validation: Validation,
}

impl GoogleIdTokenVerifier {
    pub fn new(client_id: &str, issuers: &[String], leeway_secs: u64, keys: JwksCache) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[client_id]);
        validation.set_issuer(issuers);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        validation.leeway = leeway_secs;

        Self { keys, validation }
    }

    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        let source = HttpJwksSource::new(config.external_jwks_url.clone(), config.external_timeout)
            .map_err(|err| AuthError::Config(format!("external key source: {err}")))?;

        Ok(Self::new(
            &config.external_client_id,
            &config.external_issuers,
            config.external_leeway_secs,
            JwksCache::new(Arc::new(source)),
        ))
    }
}

#[rocket::async_trait]
impl ExternalIdentityVerifier for GoogleIdTokenVerifier {
    async fn verify(&self, assertion: &str) -> AuthResult<Option<ExternalIdentity>> {
        let header = match decode_header(assertion) {
            Ok(header) => header,
            Err(err) => {
                warn!("external token rejected: malformed header ({:?})", err.kind());
                return Ok(None);
            }
        };

        let Some(kid) = header.kid else {
            warn!("external token rejected: no key id");
            return Ok(None);
        };

        let key = match self.keys.decoding_key(&kid).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!("external token rejected: unknown key id {}", kid);
                return Ok(None);
            }
            Err(err) => {
                error!("external key source unavailable: {}", err);
                return Err(AuthError::VerifierUnavailable(err.to_string()));
            }
        };

        let claims = match decode::<IdTokenClaims>(assertion, &key, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                warn!("external token rejected: {:?}", err.kind());
                return Ok(None);
            }
        };

        let Some(email) = claims.email.filter(|email| !email.trim().is_empty()) else {
            warn!("external token rejected: no email for subject {}", claims.sub);
            return Ok(None);
        };

        if let Some(verified) = &claims.email_verified {
            if !verified.is_verified() {
                warn!("external token rejected: unverified email for subject {}", claims.sub);
                return Ok(None);
            }
        }

        Ok(Some(ExternalIdentity {
            subject: claims.sub,
            email,
            display_name: claims
                .name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::test_support::TestIdentityProvider;

    struct CountingSource {
        inner: StaticJwksSource,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(keys: JwkSet, fail: bool) -> Self {
            Self {
                inner: StaticJwksSource::new(keys),
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[rocket::async_trait]
    impl JwksSource for CountingSource {
        async fn fetch(&self) -> Result<FetchedJwks, JwksError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(JwksError::Timeout(Duration::from_millis(5)));
            }
            self.inner.fetch().await
        }
    }

    fn verifier_with(provider: &TestIdentityProvider, source: Arc<dyn JwksSource>) -> GoogleIdTokenVerifier {
        GoogleIdTokenVerifier::new(
            &provider.client_id,
            &[provider.issuer.clone()],
            0,
            JwksCache::new(source),
        )
    }

    #[tokio::test]
    async fn accepts_valid_token_and_extracts_identity() {
        let provider = TestIdentityProvider::new();
        let verifier = provider.verifier();

        let token = provider.id_token("g-123", "ada@x.com", Some("Ada Lovelace"));
        let identity = verifier.verify(&token).await.expect("no transient error");

        assert_eq!(
            identity,
            Some(ExternalIdentity {
                subject: "g-123".into(),
                email: "ada@x.com".into(),
                display_name: Some("Ada Lovelace".into()),
            })
        );
    }

    #[tokio::test]
    async fn rejects_wrong_audience_issuer_and_expired_tokens() {
        let provider = TestIdentityProvider::new();
        let verifier = provider.verifier();
        let now = Utc::now().timestamp();

        let mut wrong_audience = provider.claims("g-1", "a@x.com", None);
        wrong_audience["aud"] = json!("someone-else.apps.example");
        let mut wrong_issuer = provider.claims("g-1", "a@x.com", None);
        wrong_issuer["iss"] = json!("https://evil.example");
        let mut expired = provider.claims("g-1", "a@x.com", None);
        expired["iat"] = json!(now - 7200);
        expired["exp"] = json!(now - 3600);

        for claims in [wrong_audience, wrong_issuer, expired] {
            let token = provider.sign(&claims);
            assert_eq!(verifier.verify(&token).await.expect("no transient error"), None);
        }
    }

    #[tokio::test]
    async fn rejects_foreign_signature_unverified_email_and_garbage() {
        let provider = TestIdentityProvider::new();
        let rogue = TestIdentityProvider::rogue();
        let verifier = provider.verifier();

        let forged = rogue.id_token("g-1", "a@x.com", None);
        assert_eq!(verifier.verify(&forged).await.unwrap(), None);

        let mut unverified = provider.claims("g-1", "a@x.com", None);
        unverified["email_verified"] = json!("false");
        assert_eq!(verifier.verify(&provider.sign(&unverified)).await.unwrap(), None);

        let mut no_email = provider.claims("g-1", "a@x.com", None);
        no_email.as_object_mut().unwrap().remove("email");
        assert_eq!(verifier.verify(&provider.sign(&no_email)).await.unwrap(), None);

        assert_eq!(verifier.verify("definitely-not-a-jwt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn caches_keys_and_rate_limits_unknown_kid_refetch() {
        let provider = TestIdentityProvider::new();
        let source = Arc::new(CountingSource::new(provider.jwks(), false));
        let verifier = verifier_with(&provider, source.clone());

        for _ in 0..3 {
            let token = provider.id_token("g-1", "a@x.com", None);
            assert!(verifier.verify(&token).await.unwrap().is_some());
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let stranger = TestIdentityProvider::with_kid("rotated-key");
        let token = stranger.id_token("g-1", "a@x.com", None);
        assert_eq!(verifier.verify(&token).await.unwrap(), None);
        assert_eq!(verifier.verify(&token).await.unwrap(), None);
        // Within the minimum refresh interval an unknown kid does not trigger more fetches.
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_kid_triggers_refetch_once_interval_passed() {
        let provider = TestIdentityProvider::new();
        let source = Arc::new(CountingSource::new(provider.jwks(), false));
        let verifier = GoogleIdTokenVerifier::new(
            &provider.client_id,
            &[provider.issuer.clone()],
            0,
            JwksCache::with_refresh_interval(source.clone(), Duration::ZERO),
        );

        let token = provider.id_token("g-1", "a@x.com", None);
        assert!(verifier.verify(&token).await.unwrap().is_some());

        let stranger = TestIdentityProvider::with_kid("rotated-key");
        let token = stranger.id_token("g-1", "a@x.com", None);
        assert_eq!(verifier.verify(&token).await.unwrap(), None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_key_source_is_transient() {
        let provider = TestIdentityProvider::new();
        let source = Arc::new(CountingSource::new(provider.jwks(), true));
        let verifier = verifier_with(&provider, source);

        let token = provider.id_token("g-1", "a@x.com", None);
        let err = verifier.verify(&token).await.expect_err("transient failure");
        assert!(matches!(err, AuthError::VerifierUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn parses_cache_control_max_age() {
        assert_eq!(
            parse_max_age("public, max-age=19845, must-revalidate, no-transform"),
            Some(Duration::from_secs(19845))
        );
        assert_eq!(parse_max_age("no-store"), None);
    }
}
