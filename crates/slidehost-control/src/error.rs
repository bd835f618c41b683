use std::collections::BTreeMap;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use slidehost_agent::AgentError;

use crate::security::RequestMeta;

/// Error body returned by every route.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub field_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        meta: &RequestMeta,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            request_id: meta.request_id.clone(),
            field_errors: BTreeMap::new(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn bad_request(meta: &RequestMeta, code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, meta, code, message)
    }

    pub fn not_found(meta: &RequestMeta, what: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            meta,
            "not_found",
            format!("presentation not found: {what}"),
        )
    }

    pub fn from_agent(err: AgentError, meta: &RequestMeta) -> Self {
        let status = match &err {
            AgentError::Validation { .. } => StatusCode::BAD_REQUEST,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::ResourceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            AgentError::ServiceUnavailable(_) | AgentError::ProcessStartup(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AgentError::Filesystem(_) | AgentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &err {
            AgentError::Internal(e) => {
                tracing::error!(request_id = %meta.request_id, error = ?e, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut out = Self::new(status, meta, err.code(), message);
        if let Some(fields) = err.field_errors() {
            out.field_errors = fields.clone();
        }
        match &err {
            AgentError::CapacityExceeded { .. } | AgentError::ResourceExhausted { .. } => {
                out.with_hint("delete an existing presentation or retry later")
            }
            _ => out,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(
                request_id = %self.request_id,
                status = self.status.as_u16(),
                code = %self.code,
                message = %self.message,
                "request failed"
            );
        }
        (self.status, Json(self)).into_response()
    }
}
