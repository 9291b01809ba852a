//! Wire envelopes shared with the streaming service.
//!
//! Two flavors travel over the same kind of websocket:
//! - push streams: `{"type", "req_id", "data", ...}` ([`PushFrame`])
//! - GraphQL subscriptions: `{"id", "type", "payload"}`
//!   ([`GraphqlClientMessage`] outbound, [`GraphqlServerFrame`] inbound)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PUSH_LISTEN: &str = "listen";
pub const PUSH_UNLISTEN: &str = "unlisten";
pub const PUSH_LISTENING: &str = "listening";
pub const PUSH_UNLISTENED: &str = "unlistened";
pub const PUSH_ERROR: &str = "error";
pub const PUSH_PING: &str = "ping";
pub const PUSH_PROGRESS: &str = "progress";

/// Flat push-stream envelope, used in both directions.
///
/// Optional request fields (`fetch`, `start_block`, `with_progress`, ...)
/// ride along as top-level keys in `extras`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl PushFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// GraphQL operation as carried by `start` frames and HTTP queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(
        default,
        rename = "operationName",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphqlClientMessage {
    ConnectionInit { payload: Value },
    Start { id: String, payload: GraphqlRequest },
    Stop { id: String },
    ConnectionTerminate,
}

impl GraphqlClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub const GQL_CONNECTION_ACK: &str = "connection_ack";
pub const GQL_CONNECTION_ERROR: &str = "connection_error";
pub const GQL_KEEP_ALIVE: &str = "ka";
pub const GQL_DATA: &str = "data";
pub const GQL_ERROR: &str = "error";
pub const GQL_COMPLETE: &str = "complete";

/// Inbound GraphQL frame. Kept loose so unknown control types still decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphqlServerFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl GraphqlServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
