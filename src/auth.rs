//! Credentials, bearer tokens and phone verification.

pub mod password;
pub mod token;
pub mod verification;

use thiserror::Error;

pub use password::{Argon2Hasher, CredentialHasher};
pub use token::{Claims, TokenService};
pub use verification::{CodeSender, CodeStore, LogCodeSender, PhoneVerifier, VerificationError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("stored password hash is malformed")]
    MalformedHash,

    #[error("token creation failed: {0}")]
    TokenCreation(String),

    #[error("invalid token")]
    InvalidToken,
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), AuthError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), AuthError> {
        getrandom::getrandom(out).map_err(|_| AuthError::RandomUnavailable)
    }
}
