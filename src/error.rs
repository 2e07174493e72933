//! Error types for the Threadline client

use serde_json::Value;
use thiserror::Error;

/// Client error kinds.
///
/// Callers branch on the variant, never on message text.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The session could not be recovered after the single silent refresh.
    ///
    /// `redirect` carries the portal entry path the host should navigate to
    /// when the failing request could be attributed to a portal.
    #[error("Your session has expired. Please log in again.")]
    SessionExpired { redirect: Option<String> },

    /// The server answered with a non-success status outside the expiry path.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Pulls a human-readable message out of a parsed error body, falling back
/// to the transport status line.
pub(crate) fn message_from_body(body: &Value, status: u16) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .map(str::to_owned)
        .unwrap_or_else(|| format!("HTTP error! status: {status}"))
}
