//! Error taxonomy for the push channel, polling, and scan start-up.
//!
//! Transient errors ([`ConnectionError`], [`PollError`], [`MalformedMessageError`]) are
//! absorbed by the component that hits them and only show up in logs or handler hooks.
//! [`StartScanError`] and [`SessionAbortedError`] are the user-visible ones.

use std::time::Duration;

use thiserror::Error;

/// Failures of the push connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("invalid push endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no pong within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("connection attempt cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// Errors that retrying cannot fix.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            ConnectionError::InvalidEndpoint(_) | ConnectionError::Tls(_)
        )
    }
}

/// Failures of the REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Status { status: u16, message: Option<String> },

    #[error("invalid API url: {0}")]
    Url(String),
}

impl ApiError {
    /// Message supplied by the backend in the error body, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Status { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

/// A status or listing poll failed; retried on the next tick.
#[derive(Debug, Error)]
#[error("poll of {target} failed: {source}")]
pub struct PollError {
    pub target: String,
    #[source]
    pub source: ApiError,
}

/// The backend reported a whole session as failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("scan session {session_id} was aborted by the backend")]
pub struct SessionAbortedError {
    pub session_id: String,
}

/// An inbound push frame that could not be decoded; dropped.
#[derive(Debug, Error)]
pub enum MalformedMessageError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Starting a scan session failed; shown to the user right away.
#[derive(Debug, Error)]
pub enum StartScanError {
    #[error("no scanners selected")]
    NoScanners,

    #[error("invalid ports: {0}")]
    InvalidPorts(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

pub const START_SCAN_FALLBACK: &str = "Failed to start scan. Please try again.";

impl StartScanError {
    /// Text for the user: the server's own message when it sent one, otherwise a
    /// generic fallback for transport failures.
    pub fn user_message(&self) -> String {
        match self {
            StartScanError::Api(api) => api
                .server_message()
                .map(str::to_string)
                .unwrap_or_else(|| START_SCAN_FALLBACK.to_string()),
            other => other.to_string(),
        }
    }
}
