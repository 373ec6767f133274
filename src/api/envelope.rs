//! Backend response envelope
//!
//! The backend wraps most bodies as `{code, message, data}` with `code == 0`
//! on success; some endpoints answer with the bare payload instead.

use crate::utils::error::{CaptureError, CaptureResult};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Wrapped {
        code: i64,
        message: Option<String>,
        data: Option<T>,
    },
    Bare(T),
}

impl<T> Envelope<T> {
    /// Unwrap the payload, turning a non-zero code into an API error
    pub fn into_data(self) -> CaptureResult<Option<T>> {
        match self {
            Envelope::Bare(data) => Ok(Some(data)),
            Envelope::Wrapped { code: 0, data, .. } => Ok(data),
            Envelope::Wrapped { code, message, .. } => Err(CaptureError::api(
                message.unwrap_or_else(|| format!("request failed with code {code}")),
            )),
        }
    }
}

/// Error body shape used by non-2xx responses
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    pub message: Option<String>,
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn describe(&self) -> Option<String> {
        match (&self.message, &self.error) {
            (Some(message), Some(error)) => Some(format!("{message}: {error}")),
            (Some(message), None) => Some(message.clone()),
            (None, Some(error)) => Some(error.clone()),
            (None, None) => None,
        }
    }

    /// The backend reports missing rows as a 500 with this text
    pub fn is_record_not_found(&self) -> bool {
        [&self.message, &self.error]
            .into_iter()
            .flatten()
            .any(|text| text.contains("record not found"))
    }
}
