//! HTTP surface: routes, bearer authentication and error mapping.

mod accounts;
mod analyze;
mod extract;
mod jwt;
mod phone;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthError, CredentialHasher, PhoneVerifier, TokenService, VerificationError};
use crate::error::{AppError, ErrorKind};
use crate::pipeline::BodyFatAnalyzer;
use crate::store::{StoreError, UserStore};

pub use jwt::AppUser;

/// Upper bound on `/fat-history` entries.
pub const HISTORY_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<BodyFatAnalyzer>,
    pub users: Arc<dyn UserStore>,
    pub hasher: Arc<dyn CredentialHasher>,
    pub tokens: Arc<TokenService>,
    pub phone: Arc<PhoneVerifier>,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/", get(root))
        .route("/signup", post(accounts::signup))
        .route("/login", post(accounts::login))
        .route("/me", get(accounts::me))
        .route("/update-password", put(accounts::update_password))
        .route("/delete-account", delete(accounts::delete_account))
        .route("/phone/send-code", post(phone::send_code))
        .route("/phone/verify", post(phone::verify_code))
        .route("/analyze-bodyfat", post(analyze::analyze_bodyfat))
        .route("/fat-history", get(analyze::fat_history))
        .layer(from_fn_with_state(state.clone(), jwt::authenticate))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[tracing::instrument(name = "GET /")]
async fn root() -> Json<MessageResponse> {
    MessageResponse::new("server is running")
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => AppError::validation(e.to_string()),
            StoreError::Storage(_) | StoreError::Corrupted { .. } => {
                AppError::new(ErrorKind::Storage, "storage unavailable")
                    .with_internal(e.to_string())
            }
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidToken => AppError::unauthorized("invalid token"),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<VerificationError> for AppError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::InvalidPhone
            | VerificationError::NoPendingCode
            | VerificationError::Expired
            | VerificationError::WrongCode { .. }
            | VerificationError::TooManyAttempts => AppError::validation(e.to_string()),
            VerificationError::Delivery(_)
            | VerificationError::RandomUnavailable
            | VerificationError::LockPoisoned => AppError::internal(e.to_string()),
        }
    }
}

/// Runs CPU-heavy work (password hashing) on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::internal(format!("blocking task failed: {e}")))?
        .map_err(AppError::from)
}
