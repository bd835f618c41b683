use axum::{
    Extension, Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slidehost_agent::{HealthReport, HealthThresholds, RegistryStats};
use slidehost_process::{
    InstanceState, InstanceStatus, PresentationId, PresentationRequest, PresentationUrls,
};

use crate::{error::ApiError, security::RequestMeta, state::AppState, validation};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPresentation {
    pub id: PresentationId,
    pub url: String,
    pub status: InstanceState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub urls: PresentationUrls,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentationSummary {
    pub id: PresentationId,
    pub status: InstanceState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresentationList {
    pub presentations: Vec<PresentationSummary>,
    pub total: usize,
    pub active: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub ttl: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Extended {
    pub id: PresentationId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub cursor: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsPage {
    pub lines: Vec<String>,
    pub cursor: u64,
}

#[derive(Debug, Serialize)]
pub struct Cleaned {
    pub cleaned: usize,
}

fn parse_id(raw: &str, meta: &RequestMeta) -> Result<PresentationId, ApiError> {
    PresentationId::parse(raw).ok_or_else(|| ApiError::not_found(meta, raw))
}

pub async fn create_presentation(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    body: Result<Json<PresentationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedPresentation>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(&meta, "invalid_json", e.body_text()))?;
    validation::validate_request(&req, &state.registry.ttl_policy())
        .map_err(|e| ApiError::from_agent(e, &meta))?;

    tracing::info!(
        request_id = %meta.request_id,
        content_chars = req.content.chars().count(),
        theme = ?req.theme,
        "create presentation"
    );
    let status = state
        .registry
        .create(req)
        .await
        .map_err(|e| ApiError::from_agent(e, &meta))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedPresentation {
            id: status.id,
            url: status.url,
            status: status.state,
            created_at: status.created_at,
            expires_at: status.expires_at,
            urls: status.urls,
        }),
    ))
}

pub async fn list_presentations(State(state): State<AppState>) -> Json<PresentationList> {
    let all = state.registry.list().await;
    let active = all
        .iter()
        .filter(|s| s.state == InstanceState::Ready)
        .count();
    let presentations: Vec<PresentationSummary> = all
        .into_iter()
        .map(|s| PresentationSummary {
            id: s.id,
            status: s.state,
            created_at: s.created_at,
            expires_at: s.expires_at,
            url: s.url,
            title: s.title,
        })
        .collect();
    Json(PresentationList {
        total: presentations.len(),
        active,
        presentations,
    })
}

pub async fn get_presentation(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(raw): Path<String>,
) -> Result<Json<InstanceStatus>, ApiError> {
    let id = parse_id(&raw, &meta)?;
    let mut status = state
        .registry
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found(&meta, id.as_str()))?;
    if status.state == InstanceState::Ready {
        // Gone between the lookup and the check reads as unhealthy.
        status.healthy = Some(state.registry.check_health(&id).await.unwrap_or(false));
    }
    Ok(Json(status))
}

pub async fn delete_presentation(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(raw): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&raw, &meta)?;
    if state.registry.delete(&id).await {
        tracing::info!(request_id = %meta.request_id, %id, "presentation deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(&meta, id.as_str()))
    }
}

pub async fn extend_presentation(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(raw): Path<String>,
    body: Result<Json<ExtendRequest>, JsonRejection>,
) -> Result<Json<Extended>, ApiError> {
    let id = parse_id(&raw, &meta)?;
    let Json(body) = body.map_err(|e| ApiError::bad_request(&meta, "invalid_json", e.body_text()))?;
    let status = state
        .registry
        .extend(&id, body.ttl)
        .await
        .map_err(|e| ApiError::from_agent(e, &meta))?;
    Ok(Json(Extended {
        id: status.id,
        expires_at: status.expires_at,
    }))
}

pub async fn presentation_logs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path(raw): Path<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<LogsPage>, ApiError> {
    let id = parse_id(&raw, &meta)?;
    let Query(q) =
        query.map_err(|e| ApiError::bad_request(&meta, "invalid_param", e.body_text()))?;
    let (lines, cursor) = state
        .registry
        .logs(&id, q.cursor.unwrap_or(0), q.limit)
        .await
        .map_err(|e| ApiError::from_agent(e, &meta))?;
    Ok(Json(LogsPage { lines, cursor }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let report = HealthReport::collect(
        &state.registry,
        state.started,
        &state.settings.temp_root,
        HealthThresholds::default(),
    )
    .await;
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

pub async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}

pub async fn cleanup(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Json<Cleaned> {
    let cleaned = state.registry.sweep_expired().await;
    tracing::info!(request_id = %meta.request_id, cleaned, "manual cleanup");
    Json(Cleaned { cleaned })
}
