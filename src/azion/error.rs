// Errors returned by the Azion API client
//
// Every failure carries enough structure for the caller to decide whether
// it is worth retrying and what to record against the metric.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the Azion API
///
/// Cloneable so one failed token renewal can be handed to every caller
/// that was waiting on it.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Token exchange failed: bad credentials or a malformed token response
    #[error("authentication failed{}: {message}", status_suffix(.status))]
    Auth {
        status: Option<u16>,
        message: String,
        errors: Option<ErrorMessages>,
    },

    /// The API answered with a non-2xx status
    #[error("upstream returned HTTP {status}{}", describe_errors(.errors.as_ref(), .body))]
    Upstream {
        status: u16,
        body: String,
        errors: Option<ErrorMessages>,
    },

    /// Network level failure (connect, TLS, read, request timeout)
    #[error("transport error: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// The whole operation exceeded its time budget
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// A 2xx response whose body is not what the endpoint documents
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The HTTP client itself could not be built
    #[error("invalid client setup: {0}")]
    Client(String),
}

impl ApiError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Timeout(_) => true,
            ApiError::Upstream { status, .. } => *status >= 500 || *status == 429 || *status == 401,
            ApiError::Auth { .. } | ApiError::Malformed(_) | ApiError::Client(_) => false,
        }
    }

    /// HTTP status attached to the error, if the API answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Auth { status, .. } => *status,
            ApiError::Upstream { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            ApiError::Timeout(_) | ApiError::Malformed(_) | ApiError::Client(_) => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(Arc::new(e))
    }
}

/// Error messages produced by the Azion API.
///
/// Non-2xx responses carry `{"errors": {"params": {...}, "request": [...], "system": [...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorMessages {
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub request: Vec<String>,
    #[serde(default)]
    pub system: Vec<String>,
}

impl ErrorMessages {
    /// Parses an error body, returning `None` when it is not the documented shape.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            errors: ErrorMessages,
        }

        serde_json::from_slice::<Envelope>(body)
            .ok()
            .map(|envelope| envelope.errors)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.request.is_empty() && self.system.is_empty()
    }
}

impl fmt::Display for ErrorMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        parts.extend(self.system.iter().map(|m| format!("system: {}", m)));
        parts.extend(self.request.iter().map(|m| format!("request: {}", m)));
        parts.extend(self.params.iter().map(|(k, v)| format!("param {}: {}", k, v)));
        write!(f, "{}", parts.join("; "))
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

fn describe_errors(errors: Option<&ErrorMessages>, body: &str) -> String {
    match errors {
        Some(errors) if !errors.is_empty() => format!(": {}", errors),
        _ if !body.trim().is_empty() => format!(": {}", truncate(body.trim(), 256)),
        _ => String::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
