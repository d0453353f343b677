use std::time::{Duration, UNIX_EPOCH};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    access::{Delivered, NewPaste},
    error::AccessError,
    AppState,
};

// ── Info / health ─────────────────────────────────────────────────────────────

pub async fn api_info() -> impl IntoResponse {
    Json(json!({
        "message": "QuickShare API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, AccessError> {
    let pastes = state.service.count().await?;
    Ok(Json(json!({"status": "ok", "pastes": pastes})))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub content: String,
    #[serde(default)]
    pub expire_hours: i64,
    #[serde(default)]
    pub max_views: i64,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub unique_id: String,
    pub share_url: String,
    pub expire_hours: u64,
    pub max_views: u32,
    pub has_password: bool,
}

pub async fn create_paste(
    State(state): State<AppState>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AccessError> {
    let Json(body) = body.map_err(|e| AccessError::Validation(e.body_text()))?;

    let created = state
        .service
        .create(NewPaste {
            content: body.content,
            expire_hours: body.expire_hours,
            max_views: body.max_views,
            password: body.password,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            unique_id: created.id,
            share_url: created.share_url,
            expire_hours: created.expire_hours,
            max_views: created.max_views,
            has_password: created.has_password,
        }),
    ))
}

// ── Get ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub content: String,
    /// RFC 3339, UTC.
    pub expires_at: Option<String>,
    /// `0` means unlimited.
    pub max_views: u32,
    pub view_count: u32,
    pub will_destroy: bool,
    pub requires_password: bool,
}

impl ViewResponse {
    fn from_delivered(d: Delivered) -> Self {
        Self {
            content: d.content.as_str().to_owned(),
            expires_at: d.expires_at.map(format_timestamp),
            max_views: d.max_views.unwrap_or(0),
            view_count: d.view_count,
            will_destroy: d.will_destroy,
            requires_password: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

pub async fn get_paste(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ViewResponse>, AccessError> {
    let delivered = state.service.get(&id, None).await?;
    Ok(Json(ViewResponse::from_delivered(delivered)))
}

pub async fn get_paste_with_password(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<PasswordRequest>, JsonRejection>,
) -> Result<Json<ViewResponse>, AccessError> {
    let Json(body) = body.map_err(|e| AccessError::Validation(e.body_text()))?;
    let delivered = state.service.get(&id, Some(&body.password)).await?;
    Ok(Json(ViewResponse::from_delivered(delivered)))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// 9999-12-31T23:59:59Z, the last instant RFC 3339 can express.
const MAX_RFC3339_SECS: i64 = 253_402_300_799;

fn format_timestamp(secs: i64) -> String {
    let t = UNIX_EPOCH + Duration::from_secs(secs.clamp(0, MAX_RFC3339_SECS) as u64);
    humantime::format_rfc3339_seconds(t).to_string()
}
