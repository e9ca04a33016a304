use axum::extract::State;
use axum::{Extension, Json};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::extract::{ApiJson, ApiQuery};
use super::{blocking, AppState, AppUser, MessageResponse};
use crate::auth::verification::normalize_phone;
use crate::error::{AppError, AppResult};
use crate::store::{NewUser, User};

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub phone_number: String,
    pub email: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub email: String,
    pub new_password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountQuery {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    pub email: String,
    pub phone_verified: bool,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            phone_number: user.phone_number,
            email: user.email,
            phone_verified: user.phone_verified,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

fn normalize_email(raw: &str) -> Result<String, AppError> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !valid {
        return Err(AppError::validation("invalid email address"));
    }
    Ok(email)
}

fn require_non_blank(field: &'static str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(
            AppError::validation(format!("{field} must not be empty")).with_context("field", field)
        );
    }
    Ok(())
}

/// The token subject must match the account being changed.
fn require_owner(user: &AppUser, email: &str) -> Result<(), AppError> {
    if user.require()? != email {
        return Err(AppError::unauthorized("unauthorized"));
    }
    Ok(())
}

#[instrument(name = "POST /signup", skip(state, body), fields(email = %body.email))]
pub async fn signup(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SignupRequest>,
) -> AppResult<Json<UserResponse>> {
    require_non_blank("name", &body.name)?;
    require_non_blank("phone_number", &body.phone_number)?;
    require_non_blank("password", body.password.expose_secret())?;
    let email = normalize_email(&body.email)?;
    let phone_key = normalize_phone(&body.phone_number)?;

    let hasher = state.hasher.clone();
    let password = body.password;
    let hashed_password = blocking(move || hasher.hash(&password)).await?;

    let user = state
        .users
        .create_user(&NewUser {
            email,
            hashed_password,
            name: body.name.trim().to_string(),
            phone_number: body.phone_number.trim().to_string(),
            phone_key,
        })
        .await?;

    info!(user_id = user.id, "account created");
    Ok(Json(user.into()))
}

#[instrument(name = "POST /login", skip(state, body), fields(email = %body.email))]
pub async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> AppResult<Json<TokenResponse>> {
    let rejected = || AppError::validation("invalid email or password");

    let email = body.email.trim().to_lowercase();
    let user = state.users.find_by_email(&email).await?;

    let hasher = state.hasher.clone();
    let password = body.password;
    let Some(user) = user else {
        // same Argon2 cost as a real check, so unknown emails take as long
        blocking(move || hasher.hash(&password)).await?;
        return Err(rejected());
    };
    let stored = user.hashed_password.clone();
    if !blocking(move || hasher.verify(&password, &stored)).await? {
        return Err(rejected());
    }

    Ok(Json(TokenResponse {
        access_token: state.tokens.issue(&user.email)?,
        token_type: "bearer".to_string(),
    }))
}

#[instrument(name = "GET /me", skip(state))]
pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AppUser>,
) -> AppResult<Json<UserResponse>> {
    let email = user.require()?;
    let user = state
        .users
        .find_by_email(email)
        .await?
        .ok_or_else(|| AppError::unauthorized("user not found"))?;
    Ok(Json(user.into()))
}

#[instrument(name = "PUT /update-password", skip(state, body), fields(email = %body.email))]
pub async fn update_password(
    State(state): State<AppState>,
    Extension(user): Extension<AppUser>,
    ApiJson(body): ApiJson<UpdatePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    let email = body.email.trim().to_lowercase();
    require_owner(&user, &email)?;
    require_non_blank("new_password", body.new_password.expose_secret())?;

    let hasher = state.hasher.clone();
    let password = body.new_password;
    let hashed = blocking(move || hasher.hash(&password)).await?;

    if !state.users.update_password(&email, &hashed).await? {
        return Err(AppError::not_found("user not found"));
    }
    info!("password changed");
    Ok(MessageResponse::new("password updated"))
}

#[instrument(name = "DELETE /delete-account", skip(state))]
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(user): Extension<AppUser>,
    ApiQuery(query): ApiQuery<DeleteAccountQuery>,
) -> AppResult<Json<MessageResponse>> {
    let email = query.email.trim().to_lowercase();
    require_owner(&user, &email)?;

    if !state.users.delete_user(&email).await? {
        return Err(AppError::not_found("user not found"));
    }
    info!("account deleted");
    Ok(MessageResponse::new("account deleted"))
}
