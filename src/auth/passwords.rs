use argon2::{
    Algorithm, Argon2, ParamsBuilder, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::RngCore;

use crate::auth::{AuthError, AuthResult};
use crate::store::UNUSABLE_PASSWORD_HASH;

const SALT_LEN: usize = 16;

/// Argon2id hashing with a fresh random salt per hash.
///
/// Verification is CPU-bound; async callers run it on the blocking pool.
#[derive(Clone)]
pub struct PasswordService {
    argon2: Argon2<'static>,
    decoy_hash: String,
}

impl PasswordService {
    pub fn new() -> AuthResult<Self> {
        let mut builder = ParamsBuilder::new();
        builder.m_cost(19 * 1024); // 19 MiB
        builder.t_cost(2);
        builder.p_cost(1);
        let params = builder.build().map_err(AuthError::from)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut decoy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut decoy);
        let decoy_hash = hash_with(&argon2, &decoy)?;

        Ok(Self { argon2, decoy_hash })
    }

    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        hash_with(&self.argon2, password.as_bytes())
    }

    /// `Ok(false)` on mismatch and for the unusable placeholder hash.
    pub fn verify_password(&self, password: &str, encoded: &str) -> AuthResult<bool> {
        if encoded == UNUSABLE_PASSWORD_HASH {
            self.verify_decoy(password);
            return Ok(false);
        }

        let parsed = PasswordHash::new(encoded)?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(AuthError::from(err)),
        }
    }

    /// Spend one verification's worth of work against a hash nobody knows the
    /// password for, so a missing account costs the same as a wrong password.
    pub fn verify_decoy(&self, password: &str) {
        if let Ok(parsed) = PasswordHash::new(&self.decoy_hash) {
            let _ = self.argon2.verify_password(password.as_bytes(), &parsed);
        }
    }
}

fn hash_with(argon2: &Argon2<'static>, password: &[u8]) -> AuthResult<String> {
    let mut salt_bytes = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes).map_err(AuthError::from)?;
    let hash = argon2
        .hash_password(password, &salt)
        .map_err(AuthError::from)?
        .to_string();
    Ok(hash)
}
