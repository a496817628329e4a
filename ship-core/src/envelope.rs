//! The uniform REST response envelope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// `{ status, data, message? }` as returned by every backend endpoint.
///
/// Framework-level error pages (401/404 from the router) omit `status` and
/// carry `error` instead, so `status` defaults to `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "default_status")]
    pub status: EnvelopeStatus,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_status() -> EnvelopeStatus {
    EnvelopeStatus::Error
}

impl<T> ApiEnvelope<T> {
    pub fn is_success(&self) -> bool {
        self.status == EnvelopeStatus::Success
    }

    /// Best human-readable explanation the server gave, if any.
    pub fn server_message(&self) -> Option<&str> {
        let non_blank = |m: &&str| !m.trim().is_empty();
        self.message
            .as_deref()
            .filter(non_blank)
            .or_else(|| self.error.as_deref().filter(non_blank))
    }
}
