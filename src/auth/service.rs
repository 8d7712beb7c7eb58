//! Registration, login (password and external identity), refresh and profile
//! flows over an [`IdentityStore`].
//!
//! Each public method is one unit of work. Uniqueness races are settled by the
//! store: a register that loses becomes `EmailTaken`, an external login that
//! loses re-reads the winner's row and carries on.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::auth::external::{ExternalIdentity, ExternalIdentityVerifier};
use crate::auth::jwt::{TokenKind, TokenService};
use crate::auth::passwords::PasswordService;
use crate::auth::responses::{AuthResponse, ProfileResponse, RegisterRequest, Role};
use crate::auth::{AuthError, AuthResult};
use crate::store::{
    Identity, IdentityStore, LinkOutcome, NewIdentity, StoreError, UNUSABLE_PASSWORD_HASH,
};

pub const MIN_PASSWORD_LEN: usize = 6;
const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// Emails are compared and stored trimmed and lower-cased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

enum Resolution {
    Resolved(Identity),
    /// A concurrent request changed the rows this attempt was based on.
    Retry,
}

pub struct AuthService {
    store: Arc<dyn IdentityStore>,
    passwords: PasswordService,
    tokens: Arc<TokenService>,
    verifier: Arc<dyn ExternalIdentityVerifier>,
    default_role: Role,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        passwords: PasswordService,
        tokens: Arc<TokenService>,
        verifier: Arc<dyn ExternalIdentityVerifier>,
        default_role: Role,
    ) -> Self {
        Self {
            store,
            passwords,
            tokens,
            verifier,
            default_role,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn register(&self, request: RegisterRequest) -> AuthResult<AuthResponse> {
        let full_name = request.full_name.trim().to_string();
        let email = normalize_email(&request.email);

        if full_name.is_empty() {
            return Err(AuthError::Validation("full name is required".into()));
        }
        if !is_plausible_email(&email) {
            return Err(AuthError::Validation("a valid email is required".into()));
        }
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        // Fast path only; the unique constraint on insert is what guarantees it.
        if self.store.find_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.hash_password(request.password).await?;
        let identity = self
            .store
            .insert(NewIdentity {
                full_name,
                email,
                password_hash,
                external_subject_id: None,
                role: request.role.unwrap_or(self.default_role),
            })
            .await?;

        info!("registered identity {} as {}", identity.id, identity.role);
        self.respond_with_tokens(&identity)
    }

    pub async fn login(&self, email: &str, password: &str) -> AuthResult<AuthResponse> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::Validation("email and password are required".into()));
        }

        let identity = match self.store.find_by_email(&email).await? {
            Some(identity) if identity.has_usable_password() => identity,
            _ => {
                self.burn_decoy(password.to_string()).await?;
                return Err(AuthError::InvalidCredentials);
            }
        };

        let verified = self
            .check_password(password.to_string(), identity.password_hash.clone())
            .await?;
        if !verified || !identity.active {
            debug!("password login refused for identity {}", identity.id);
            return Err(AuthError::InvalidCredentials);
        }

        info!("password login for identity {}", identity.id);
        self.respond_with_tokens(&identity)
    }

    pub async fn login_with_external_identity(&self, assertion: &str) -> AuthResult<AuthResponse> {
        let external = self
            .verifier
            .verify(assertion.trim())
            .await?
            .ok_or(AuthError::InvalidExternalToken)?;

        let external = ExternalIdentity {
            email: normalize_email(&external.email),
            ..external
        };

        let identity = self.resolve_external(&external).await?;
        if !identity.active {
            debug!("external login refused for inactive identity {}", identity.id);
            return Err(AuthError::InvalidCredentials);
        }

        info!("external login for identity {}", identity.id);
        self.respond_with_tokens(&identity)
    }

    /// Exchange a refresh token for a new pair. The role comes from the store,
    /// never from the presented token.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<AuthResponse> {
        let claims = self.tokens.verify(refresh_token)?;
        if claims.typ != TokenKind::Refresh {
            return Err(AuthError::Unauthorized);
        }

        let identity = self
            .store
            .find_by_id(claims.uid)
            .await?
            .filter(|identity| {
                identity.active && self.tokens.is_valid_for(refresh_token, &identity.email)
            })
            .ok_or(AuthError::InvalidCredentials)?;

        debug!("refreshed credentials for identity {}", identity.id);
        self.respond_with_tokens(&identity)
    }

    pub async fn profile(&self, email: &str) -> AuthResult<ProfileResponse> {
        let identity = self
            .store
            .find_by_email(&normalize_email(email))
            .await?
            .ok_or(AuthError::NotFound)?;
        Ok(ProfileResponse::from(&identity))
    }

    /// Deactivation is the only way an identity is retired; rows are never deleted.
    /// Tokens already issued stay valid until they expire.
    pub async fn set_active(&self, user_id: i64, active: bool) -> AuthResult<ProfileResponse> {
        let identity = self
            .store
            .set_active(user_id, active)
            .await?
            .ok_or(AuthError::NotFound)?;
        info!("identity {} active={}", identity.id, identity.active);
        Ok(ProfileResponse::from(&identity))
    }

    /// Create the administrator account if no identity owns `email` yet.
    /// Returns `true` when a row was created.
    pub async fn ensure_admin(&self, full_name: &str, email: &str, password: &str) -> AuthResult<bool> {
        let email = normalize_email(email);
        if self.store.find_by_email(&email).await?.is_some() {
            return Ok(false);
        }

        let password_hash = self.hash_password(password.to_string()).await?;
        let result = self
            .store
            .insert(NewIdentity {
                full_name: full_name.trim().to_string(),
                email,
                password_hash,
                external_subject_id: None,
                role: Role::Admin,
            })
            .await;

        match result {
            Ok(identity) => {
                info!("seeded administrator identity {}", identity.id);
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn resolve_external(&self, external: &ExternalIdentity) -> AuthResult<Identity> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            match self.resolve_external_once(external).await? {
                Resolution::Resolved(identity) => return Ok(identity),
                Resolution::Retry => {
                    debug!(
                        "external identity resolution raced (attempt {} of {})",
                        attempt, MAX_RESOLVE_ATTEMPTS
                    );
                }
            }
        }

        warn!(
            "external identity resolution did not settle after {} attempts",
            MAX_RESOLVE_ATTEMPTS
        );
        Err(AuthError::StoreUnavailable(
            "external identity resolution kept conflicting".into(),
        ))
    }

    async fn resolve_external_once(&self, external: &ExternalIdentity) -> AuthResult<Resolution> {
        if let Some(identity) = self.store.find_by_external_subject(&external.subject).await? {
            return Ok(Resolution::Resolved(identity));
        }

        if let Some(existing) = self.store.find_by_email(&external.email).await? {
            return self.link_existing(existing, &external.subject).await;
        }

        let created = self
            .store
            .insert(NewIdentity {
                full_name: external
                    .display_name
                    .clone()
                    .unwrap_or_else(|| external.email.clone()),
                email: external.email.clone(),
                password_hash: UNUSABLE_PASSWORD_HASH.to_string(),
                external_subject_id: Some(external.subject.clone()),
                role: Role::LEAST_PRIVILEGED,
            })
            .await;

        match created {
            Ok(identity) => {
                info!("created identity {} from external login", identity.id);
                Ok(Resolution::Resolved(identity))
            }
            Err(StoreError::Conflict(_)) => Ok(Resolution::Retry),
            Err(err) => Err(err.into()),
        }
    }

    async fn link_existing(&self, existing: Identity, subject: &str) -> AuthResult<Resolution> {
        match existing.external_subject_id.as_deref() {
            Some(linked) if linked == subject => return Ok(Resolution::Resolved(existing)),
            Some(_) => return Err(AuthError::ExternalIdentityAlreadyLinked),
            None => {}
        }

        match self.store.link_external_subject(existing.id, subject).await {
            Ok(LinkOutcome::Linked(identity)) => {
                info!("linked external subject to identity {}", identity.id);
                Ok(Resolution::Resolved(identity))
            }
            Ok(LinkOutcome::AlreadyLinked(current)) => {
                if current.external_subject_id.as_deref() == Some(subject) {
                    Ok(Resolution::Resolved(current))
                } else {
                    Err(AuthError::ExternalIdentityAlreadyLinked)
                }
            }
            Ok(LinkOutcome::Missing) | Err(StoreError::Conflict(_)) => Ok(Resolution::Retry),
            Err(err) => Err(err.into()),
        }
    }

    fn respond_with_tokens(&self, identity: &Identity) -> AuthResult<AuthResponse> {
        let pair = self.tokens.issue_pair(identity)?;
        Ok(AuthResponse {
            access_token: pair.access.token,
            refresh_token: pair.refresh.token,
            user_id: identity.id,
            full_name: identity.full_name.clone(),
            email: identity.email.clone(),
            role: identity.role,
        })
    }

    async fn hash_password(&self, password: String) -> AuthResult<String> {
        let passwords = self.passwords.clone();
        tokio::task::spawn_blocking(move || passwords.hash_password(&password)).await?
    }

    async fn check_password(&self, password: String, hash: String) -> AuthResult<bool> {
        let passwords = self.passwords.clone();
        tokio::task::spawn_blocking(move || passwords.verify_password(&password, &hash)).await?
    }

    async fn burn_decoy(&self, password: String) -> AuthResult<()> {
        let passwords = self.passwords.clone();
        tokio::task::spawn_blocking(move || passwords.verify_decoy(&password)).await?;
        Ok(())
    }
}
