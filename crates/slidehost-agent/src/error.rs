use std::collections::BTreeMap;

use slidehost_process::PresentationId;

use crate::support::truncate_utf8;

const MAX_MESSAGE_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{message}")]
    Validation {
        code: String,
        message: String,
        field_errors: BTreeMap<String, String>,
    },

    #[error("presentation not found: {0}")]
    NotFound(PresentationId),

    #[error("maximum concurrent presentations reached ({limit})")]
    CapacityExceeded { limit: usize },

    #[error("no free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("renderer failed to start: {0}")]
    ProcessStartup(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        AgentError::Validation {
            code: code.to_string(),
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
            field_errors: BTreeMap::new(),
        }
    }

    pub fn invalid_field(code: &str, field: &str, message: impl Into<String>) -> Self {
        let message = truncate_utf8(&message.into(), MAX_MESSAGE_BYTES);
        let mut field_errors = BTreeMap::new();
        field_errors.insert(field.to_string(), message.clone());
        AgentError::Validation {
            code: code.to_string(),
            message,
            field_errors,
        }
    }

    pub fn startup(message: impl Into<String>) -> Self {
        AgentError::ProcessStartup(truncate_utf8(&message.into(), MAX_MESSAGE_BYTES))
    }

    pub fn filesystem(err: &anyhow::Error) -> Self {
        AgentError::Filesystem(truncate_utf8(
            &crate::support::format_error_chain(err),
            MAX_MESSAGE_BYTES,
        ))
    }

    /// Stable machine-readable code carried in API error bodies.
    pub fn code(&self) -> &str {
        match self {
            AgentError::Validation { code, .. } => code,
            AgentError::NotFound(_) => "not_found",
            AgentError::CapacityExceeded { .. } => "capacity_exceeded",
            AgentError::ResourceExhausted { .. } => "insufficient_resources",
            AgentError::ServiceUnavailable(_) => "service_unavailable",
            AgentError::ProcessStartup(_) => "process_startup_failed",
            AgentError::Filesystem(_) => "filesystem_error",
            AgentError::Internal(_) => "internal",
        }
    }

    pub fn field_errors(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            AgentError::Validation { field_errors, .. } if !field_errors.is_empty() => {
                Some(field_errors)
            }
            _ => None,
        }
    }
}
