use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RandomProvider;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CODE_SPACE: u32 = 1_000_000;
const MIN_PHONE_DIGITS: usize = 9;
const MAX_PHONE_DIGITS: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("invalid phone number")]
    InvalidPhone,

    #[error("no verification code was requested for this number")]
    NoPendingCode,

    #[error("verification code expired")]
    Expired,

    #[error("incorrect verification code, {remaining} attempts left")]
    WrongCode { remaining: u32 },

    #[error("too many incorrect attempts, request a new code")]
    TooManyAttempts,

    #[error("code delivery failed: {0}")]
    Delivery(String),

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Canonical form: optional leading `+` then 9 to 15 digits. Spaces and `-` are ignored.
pub fn normalize_phone(raw: &str) -> Result<String, VerificationError> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' => {}
            _ => return Err(VerificationError::InvalidPhone),
        }
    }

    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return Err(VerificationError::InvalidPhone);
    }
    Ok(format!("{plus}{digits}"))
}

/// Delivers a freshly generated code to the phone owner.
pub trait CodeSender: Send + Sync {
    fn send(&self, phone: &str, code: &str) -> Result<(), VerificationError>;
}

/// Writes codes to the log instead of sending an SMS.
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send(&self, phone: &str, code: &str) -> Result<(), VerificationError> {
        info!(phone, code, "verification code issued");
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PendingCode {
    digest: blake3::Hash,
    expires_at: Instant,
    attempts: u32,
}

/// Pending codes keyed by normalized phone number. Only digests are kept.
#[derive(Default)]
pub struct CodeStore {
    codes: Mutex<HashMap<String, PendingCode>>,
}

impl CodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingCode>>, VerificationError> {
        self.codes.lock().map_err(|_| VerificationError::LockPoisoned)
    }

    /// Drops every code whose expiry is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> Result<usize, VerificationError> {
        let mut codes = self.lock()?;
        let before = codes.len();
        codes.retain(|_, pending| pending.expires_at > now);
        Ok(before - codes.len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|codes| codes.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sweeps expired codes every `interval` until the returned task is aborted.
pub fn spawn_sweeper(store: Arc<CodeStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.sweep_expired(Instant::now()) {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "expired verification codes swept"),
                Err(e) => warn!(error = %e, "verification code sweep failed"),
            }
        }
    })
}

pub struct PhoneVerifier {
    store: Arc<CodeStore>,
    sender: Arc<dyn CodeSender>,
    rng: Arc<dyn RandomProvider>,
    ttl: Duration,
    max_attempts: u32,
}

impl PhoneVerifier {
    pub fn new(
        store: Arc<CodeStore>,
        sender: Arc<dyn CodeSender>,
        rng: Arc<dyn RandomProvider>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            sender,
            rng,
            ttl,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn store(&self) -> &Arc<CodeStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a new code for `phone`, replacing any pending one. Returns the normalized number.
    pub fn issue(&self, phone: &str) -> Result<String, VerificationError> {
        self.issue_at(phone, Instant::now())
    }

    pub fn issue_at(&self, phone: &str, now: Instant) -> Result<String, VerificationError> {
        let phone = normalize_phone(phone)?;
        let code = self.generate_code()?;

        self.store.lock()?.insert(
            phone.clone(),
            PendingCode {
                digest: digest(&phone, &code),
                expires_at: now + self.ttl,
                attempts: 0,
            },
        );

        if let Err(e) = self.sender.send(&phone, &code) {
            self.store.lock()?.remove(&phone);
            return Err(e);
        }
        Ok(phone)
    }

    /// Checks `code`; success consumes it. Returns the normalized number.
    pub fn verify(&self, phone: &str, code: &str) -> Result<String, VerificationError> {
        self.verify_at(phone, code, Instant::now())
    }

    pub fn verify_at(
        &self,
        phone: &str,
        code: &str,
        now: Instant,
    ) -> Result<String, VerificationError> {
        let phone = normalize_phone(phone)?;
        let mut codes = self.store.lock()?;
        let pending = codes.get_mut(&phone).ok_or(VerificationError::NoPendingCode)?;

        if pending.expires_at <= now {
            codes.remove(&phone);
            return Err(VerificationError::Expired);
        }

        // blake3::Hash equality is constant-time.
        if pending.digest == digest(&phone, code.trim()) {
            codes.remove(&phone);
            return Ok(phone);
        }

        pending.attempts += 1;
        if pending.attempts >= self.max_attempts {
            codes.remove(&phone);
            return Err(VerificationError::TooManyAttempts);
        }
        Err(VerificationError::WrongCode {
            remaining: self.max_attempts - pending.attempts,
        })
    }

    fn generate_code(&self) -> Result<String, VerificationError> {
        let mut bytes = [0u8; 4];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| VerificationError::RandomUnavailable)?;
        Ok(format!("{:06}", u32::from_le_bytes(bytes) % CODE_SPACE))
    }
}

fn digest(phone: &str, code: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(phone.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hasher.finalize()
}
