use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when using the deepseek-client library.
///
/// The type is `Clone` so that a failed stream session can hand the same error back
/// on every pull after the failure; sources that are not `Clone` are held in an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The request was rejected before any network call was attempted.
    #[error("Invalid request: {0}")]
    RequestBuild(String),

    /// Connection-level failure while sending or while reading a streamed body.
    #[error("HTTP request failed: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// The service answered with a non-success status.
    #[error("API error (status {status}): {message}")]
    Api {
        status: u16,
        message: String,
        error_type: Option<String>,
        code: Option<String>,
    },

    /// A response body or streamed frame did not match the expected schema.
    #[error("Failed to decode payload `{payload}`: {source}")]
    Decode {
        payload: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Frame-level failure on a streamed body (invalid UTF-8, oversized line, byte source error).
    #[error("Streaming error: {0}")]
    Streaming(String),

    /// The server closed the stream without sending the `[DONE]` sentinel.
    #[error("Stream ended before the [DONE] sentinel")]
    IncompleteStream,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn request_build(message: impl Into<String>) -> Self {
        Error::RequestBuild(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Error::Streaming(message.into())
    }

    /// Build a decode error, keeping the offending payload for diagnostics.
    pub fn decode(payload: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Decode {
            payload: payload.into(),
            source: Arc::new(source),
        }
    }

    /// True for caller-initiated cancellation, which is not a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// HTTP status carried by an API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Transport(Arc::new(error))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::streaming(format!("Stream error: {error}"))
    }
}
