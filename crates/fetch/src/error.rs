use std::error::Error as StdError;

/// Message fragments that mark an otherwise unclassified failure as transient.
const TRANSIENT_MARKERS: &[&str] = &["aborted", "timeout", "timed out", "fetch", "network"];

/// Everything a fetch through [`crate::RequestGateway`] can fail with.
///
/// Cloneable so every caller attached to a deduplicated request receives the
/// same settlement.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request aborted")]
    Aborted,

    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response. Terminal: never retried.
    #[error("HTTP {status}: {status_text}")]
    HttpStatus { status: u16, status_text: String },

    #[error("Empty response body from {url}")]
    EmptyBody { url: String },

    #[error("Failed to parse JSON from {url}: {message}")]
    JsonParse { url: String, message: String },

    /// The request could not be built or its body serialized.
    #[error("Invalid request: {0}")]
    Request(String),

    /// Transient failures outlasted every attempt.
    #[error("Request to {url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Aborted | Self::Network(_) => true,
            Self::HttpStatus { .. }
            | Self::EmptyBody { .. }
            | Self::JsonParse { .. }
            | Self::Exhausted { .. } => false,
            Self::Request(message) => looks_transient(message),
        }
    }

    /// HTTP status for [`FetchError::HttpStatus`], looking through `Exhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Exhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

fn looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Render an error with its whole source chain; reqwest's top-level message
/// alone rarely says what went wrong.
fn chain_message(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::Request(chain_message(&err));
        }
        Self::Network(chain_message(&err))
    }
}
