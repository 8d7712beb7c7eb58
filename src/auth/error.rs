use rocket::http::Status;
use thiserror::Error;

use crate::store::{StoreError, UniqueKey};

pub type AuthResult<T> = Result<T, AuthError>;

/// Every failure the authentication core can surface.
///
/// `InvalidCredentials` and `InvalidExternalToken` deliberately carry no detail:
/// unknown email, inactive account and wrong password are indistinguishable to
/// the caller, as are all external-token validation failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid external identity token")]
    InvalidExternalToken,
    #[error("identity already linked to a different external account")]
    ExternalIdentityAlreadyLinked,
    #[error("identity not found")]
    NotFound,
    #[error("token expired")]
    ExpiredToken,
    #[error("token signature invalid")]
    InvalidSignature,
    #[error("credential store unavailable")]
    StoreUnavailable(String),
    #[error("external identity verifier unavailable")]
    VerifierUnavailable(String),
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("argon2 parameter error: {0}")]
    Argon2(String),
    #[error("password hashing error: {0}")]
    PasswordHash(String),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("unexpected error: {0}")]
    Other(String),
}

impl AuthError {
    pub fn status(&self) -> Status {
        match self {
            AuthError::EmailTaken | AuthError::ExternalIdentityAlreadyLinked => Status::Conflict,
            AuthError::InvalidCredentials
            | AuthError::InvalidExternalToken
            | AuthError::ExpiredToken
            | AuthError::InvalidSignature
            | AuthError::Unauthorized => Status::Unauthorized,
            AuthError::NotFound => Status::NotFound,
            AuthError::StoreUnavailable(_) | AuthError::VerifierUnavailable(_) => {
                Status::ServiceUnavailable
            }
            AuthError::Validation(_) => Status::BadRequest,
            AuthError::Forbidden => Status::Forbidden,
            AuthError::Config(_)
            | AuthError::Argon2(_)
            | AuthError::PasswordHash(_)
            | AuthError::Jwt(_)
            | AuthError::Other(_) => Status::InternalServerError,
        }
    }

    /// Stable machine-readable kind reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::EmailTaken => "EMAIL_TAKEN",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::InvalidExternalToken => "INVALID_EXTERNAL_TOKEN",
            AuthError::ExternalIdentityAlreadyLinked => "EXTERNAL_IDENTITY_ALREADY_LINKED",
            AuthError::NotFound => "NOT_FOUND",
            AuthError::ExpiredToken => "EXPIRED_TOKEN",
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
            AuthError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AuthError::VerifierUnavailable(_) => "VERIFIER_UNAVAILABLE",
            AuthError::Validation(_) => "VALIDATION_FAILED",
            AuthError::Unauthorized => "UNAUTHORIZED",
            AuthError::Forbidden => "FORBIDDEN",
            AuthError::Config(_) => "CONFIGURATION",
            AuthError::Argon2(_)
            | AuthError::PasswordHash(_)
            | AuthError::Jwt(_)
            | AuthError::Other(_) => "INTERNAL",
        }
    }

    /// Transient failures a caller may retry with backoff. Nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::StoreUnavailable(_) | AuthError::VerifierUnavailable(_)
        )
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(UniqueKey::Email) => AuthError::EmailTaken,
            StoreError::Conflict(UniqueKey::ExternalSubject) => {
                AuthError::ExternalIdentityAlreadyLinked
            }
            err if err.is_transient() => AuthError::StoreUnavailable(err.to_string()),
            err => AuthError::Other(err.to_string()),
        }
    }
}

impl From<argon2::Error> for AuthError {
    fn from(err: argon2::Error) -> Self {
        AuthError::Argon2(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AuthError::PasswordHash(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        AuthError::Other(format!("blocking task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn only_unavailable_kinds_are_retryable() {
        assert!(AuthError::StoreUnavailable("down".into()).is_retryable());
        assert!(AuthError::VerifierUnavailable("down".into()).is_retryable());
        assert!(!AuthError::InvalidCredentials.is_retryable());
        assert!(!AuthError::ExpiredToken.is_retryable());
    }

    #[test]
    fn store_errors_map_to_domain_kinds() {
        assert!(matches!(
            AuthError::from(StoreError::Conflict(UniqueKey::Email)),
            AuthError::EmailTaken
        ));
        let timeout = AuthError::from(StoreError::Timeout(Duration::from_secs(1)));
        assert_eq!(timeout.code(), "STORE_UNAVAILABLE");
        assert_eq!(timeout.status(), Status::ServiceUnavailable);

        let down = StoreError::Unavailable("pool closed".into());
        assert!(down.is_transient());
        assert!(AuthError::from(down).is_retryable());

        let corrupt = StoreError::Corrupt("role 'ROOT'".into());
        assert!(!corrupt.is_transient());
        assert!(matches!(AuthError::from(corrupt), AuthError::Other(_)));
    }

    #[test]
    fn transient_details_are_not_in_the_message() {
        let err = AuthError::StoreUnavailable("connection refused to 10.0.0.5".into());
        assert_eq!(err.to_string(), "credential store unavailable");
    }
}
