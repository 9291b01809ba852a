//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the SDK returns [`LishiError`]. The type is
//! `Clone` because a single failure is frequently fanned out: a failed token
//! issuance rejects every coalesced waiter, and an exhausted reconnect cycle
//! resolves every pending `join` with the same socket error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const GENERIC_API_ERROR_MESSAGE: &str = "Failed to execute API call";

/// Structured error body returned by the remote service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiErrorData {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Server-side trace identifier, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Free-form detail map attached to the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

/// Errors produced by the SDK.
#[derive(Clone, Debug, Error)]
pub enum LishiError {
    /// Access token issuance or refresh failed.
    #[error("credential error: {message}")]
    Credential { message: String },

    /// Websocket transport failure.
    ///
    /// `retryable` is set for sends rejected while the transport is between
    /// connections; callers may resend once the next `Opened` event fires.
    #[error("socket error: {message}")]
    Socket { message: String, retryable: bool },

    /// Structured error returned by the remote service.
    #[error("api error {}: {}", .0.code, .0.message)]
    Api(ApiErrorData),

    /// Non-conforming error body, typically from a proxied backend.
    #[error("api call failed with status {status}: {message}")]
    GenericApi {
        status: u16,
        body: String,
        data: Option<Value>,
        message: String,
    },

    /// Network-level HTTP failure (connect, timeout, body read).
    #[error("request failed: {message}")]
    Http { message: String, retryable: bool },

    /// Caller misuse: duplicate stream id, invalid arguments.
    #[error("client error: {0}")]
    Client(String),

    /// A frame or response body could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl LishiError {
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    /// Terminal socket failure: not worth resending on this transport.
    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
            retryable: false,
        }
    }

    /// Transient socket failure: the transport is reconnecting.
    pub fn transient_socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
            retryable: true,
        }
    }

    /// Builds a [`LishiError::GenericApi`], lifting `data.message` when present.
    pub fn generic_api(status: u16, body: impl Into<String>, data: Option<Value>) -> Self {
        let message = data
            .as_ref()
            .and_then(|value| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| GENERIC_API_ERROR_MESSAGE.to_string());

        Self::GenericApi {
            status,
            body: body.into(),
            data,
            message,
        }
    }

    /// Whether the operation that produced this error may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Socket { retryable, .. } | Self::Http { retryable, .. } => *retryable,
            Self::GenericApi { status, .. } => *status >= 500 || *status == 429,
            Self::Credential { .. } | Self::Api(_) | Self::Client(_) | Self::Protocol(_) => false,
        }
    }
}

impl From<serde_json::Error> for LishiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LishiError>;
