//! Authentication module: configuration, password hashing, session tokens,
//! external identity verification, the orchestrating service, Rocket request
//! guards, and HTTP route handlers.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod external;
pub mod guards;
pub mod jwt;
pub mod passwords;
pub mod responses;
pub mod routes;
pub mod service;

pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use external::{ExternalIdentity, ExternalIdentityVerifier, GoogleIdTokenVerifier};
pub use guards::{AuthUser, RequireAdmin};
pub use jwt::TokenService;
pub use passwords::PasswordService;
pub use service::AuthService;

use crate::store::IdentityStore;

#[derive(Clone)]
pub struct AuthState {
    pub config: AuthConfig,
    pub token_service: Arc<TokenService>,
    pub auth_service: Arc<AuthService>,
}

impl AuthState {
    /// Wire the service graph around an already-built store and verifier.
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn IdentityStore>,
        verifier: Arc<dyn ExternalIdentityVerifier>,
    ) -> AuthResult<Self> {
        let token_service = Arc::new(TokenService::from_config(&config)?);
        let auth_service = Arc::new(AuthService::new(
            store,
            PasswordService::new()?,
            Arc::clone(&token_service),
            verifier,
            config.default_role,
        ));

        Ok(Self {
            config,
            token_service,
            auth_service,
        })
    }

    /// Create the configured administrator, if any. Safe to run on every start.
    pub async fn seed_admin(&self) -> AuthResult<bool> {
        match &self.config.seed_admin {
            Some(admin) => {
                self.auth_service
                    .ensure_admin(&admin.full_name, &admin.email, &admin.password)
                    .await
            }
            None => Ok(false),
        }
    }
}
