//! Error types and handling
//!
//! Common error types used across the coordinator.

use crate::task::state::CaptureStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinator-wide error type
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("workshop {workshop_id} already has an active capture task ({task_id})")]
    DuplicateActiveTask { workshop_id: String, task_id: String },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: CaptureStatus, to: CaptureStatus },

    #[error("signaling gateway unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("invalid signaling response: {0}")]
    InvalidSignalingResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("capture api error: {message}")]
    Api { status: Option<u16>, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CaptureError {
    pub(crate) fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::SignalingUnavailable(_) => true,
            CaptureError::Api { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500,
            },
            _ => false,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::DuplicateActiveTask { .. } => "DUPLICATE_ACTIVE_TASK",
            CaptureError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CaptureError::SignalingUnavailable(_) => "SIGNALING_UNAVAILABLE",
            CaptureError::InvalidSignalingResponse(_) => "INVALID_SIGNALING_RESPONSE",
            CaptureError::NotFound(_) => "NOT_FOUND",
            CaptureError::InvalidRequest(_) => "INVALID_REQUEST",
            CaptureError::Api { .. } => "CAPTURE_API_ERROR",
            CaptureError::Serialization(_) => "SERIALIZATION_ERROR",
            CaptureError::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Error response for frontends and the CLI
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            retryable: error.is_retryable(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;
