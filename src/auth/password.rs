use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};

use super::{AuthError, OsRng, RandomProvider};

const SALT_LEN: usize = 16;

/// One-way password storage.
pub trait CredentialHasher: Send + Sync {
    /// Returns a PHC-format hash string.
    fn hash(&self, password: &SecretString) -> Result<String, AuthError>;

    /// Constant-time check of `password` against a stored PHC string.
    fn verify(&self, password: &SecretString, phc: &str) -> Result<bool, AuthError>;
}

/// Argon2id with a random 16-byte salt per hash.
pub struct Argon2Hasher<R: RandomProvider = OsRng> {
    params: Params,
    rng: R,
}

impl Argon2Hasher<OsRng> {
    pub fn with_os_rng() -> Self {
        Self::new(OsRng, Params::default())
    }
}

impl<R: RandomProvider> Argon2Hasher<R> {
    pub fn new(rng: R, params: Params) -> Self {
        Self { params, rng }
    }

    fn argon(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }
}

impl<R: RandomProvider> CredentialHasher for Argon2Hasher<R> {
    fn hash(&self, password: &SecretString) -> Result<String, AuthError> {
        let mut salt_bytes = [0u8; SALT_LEN];
        self.rng.fill(&mut salt_bytes)?;
        let salt =
            SaltString::encode_b64(&salt_bytes).map_err(|e| AuthError::Hashing(e.to_string()))?;

        self.argon()
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Hashing(e.to_string()))
    }

    fn verify(&self, password: &SecretString, phc: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(phc).map_err(|_| AuthError::MalformedHash)?;
        match self.argon().verify_password(password.expose_secret().as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Hashing(e.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) fn fast_hasher() -> Argon2Hasher<super::testing::SequentialRng> {
    let params = Params::new(Params::MIN_M_COST, 1, 1, None).unwrap();
    Argon2Hasher::new(super::testing::SequentialRng::new(), params)
}
