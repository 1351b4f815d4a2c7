use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the chat backend on non-success responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiError {
    /// Server-provided reason, preferring `error` over `message`.
    pub fn reason(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
    }
}

#[derive(Debug, Error)]
#[error("{status}: {reason}")]
pub struct ApiException {
    pub status: u16,
    pub reason: String,
}

impl ApiException {
    /// Builds an exception from a raw response body, falling back to
    /// `fallback` when the body carries no usable reason.
    pub fn from_body(status: u16, body: &str, fallback: &str) -> Self {
        let reason = serde_json::from_str::<ApiError>(body)
            .ok()
            .and_then(|parsed| parsed.reason().map(str::to_string))
            .unwrap_or_else(|| fallback.to_string());
        Self { status, reason }
    }
}
