use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{AppState, AppUser, HISTORY_LIMIT};
use crate::error::{AppError, AppResult};
use crate::pipeline::{PredictionError, PredictionResponse};
use crate::store::FatHistoryEntry;

const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<FatHistoryEntry>,
}

#[instrument(name = "POST /analyze-bodyfat", skip(state, multipart))]
pub async fn analyze_bodyfat(
    State(state): State<AppState>,
    Extension(user): Extension<AppUser>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<PredictionResponse>> {
    let mut multipart = multipart?;
    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let content_type = field.content_type().map(str::to_owned);
        let bytes = field.bytes().await?;
        upload = Some((content_type, bytes));
        break;
    }
    let (content_type, bytes) = upload.ok_or(PredictionError::NotAnImage)?;

    let prediction = state.analyzer.analyze(content_type, bytes).await?;

    if let Some(email) = user.email() {
        record(&state, email, &prediction).await;
    }
    Ok(Json(prediction))
}

/// History is best effort; the prediction is returned either way.
async fn record(state: &AppState, email: &str, prediction: &PredictionResponse) {
    let user = match state.users.find_by_email(email).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            debug!("token subject has no account, skipping history");
            return;
        }
        Err(e) => {
            warn!(error = %e, "could not load user for history");
            return;
        }
    };

    if let Err(e) = state
        .users
        .record_prediction(user.id, &prediction.body_fat, prediction.confidence, Utc::now())
        .await
    {
        warn!(user_id = user.id, error = %e, "failed to record prediction");
    }
}

#[instrument(name = "GET /fat-history", skip(state))]
pub async fn fat_history(
    State(state): State<AppState>,
    Extension(user): Extension<AppUser>,
) -> AppResult<Json<HistoryResponse>> {
    let email = user.require()?;
    let user = state
        .users
        .find_by_email(email)
        .await?
        .ok_or_else(|| AppError::unauthorized("user not found"))?;

    let history = state.users.history(user.id, HISTORY_LIMIT).await?;
    Ok(Json(HistoryResponse { history }))
}
