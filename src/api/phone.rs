use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::extract::ApiJson;
use super::AppState;
use crate::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub phone_number: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendCodeResponse {
    pub message: String,
    pub phone_number: String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCodeRequest {
    pub phone_number: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyCodeResponse {
    pub message: String,
    pub verified_accounts: u64,
}

#[instrument(name = "POST /phone/send-code", skip(state, body))]
pub async fn send_code(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SendCodeRequest>,
) -> AppResult<Json<SendCodeResponse>> {
    let phone_number = state.phone.issue(&body.phone_number)?;
    Ok(Json(SendCodeResponse {
        message: "verification code sent".to_string(),
        phone_number,
        expires_in_secs: state.phone.ttl().as_secs(),
    }))
}

#[instrument(name = "POST /phone/verify", skip(state, body))]
pub async fn verify_code(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<VerifyCodeRequest>,
) -> AppResult<Json<VerifyCodeResponse>> {
    let phone_key = state.phone.verify(&body.phone_number, body.code.trim())?;
    let verified_accounts = state.users.mark_phone_verified(&phone_key).await?;
    info!(verified_accounts, "phone number verified");

    Ok(Json(VerifyCodeResponse {
        message: "phone number verified".to_string(),
        verified_accounts,
    }))
}
