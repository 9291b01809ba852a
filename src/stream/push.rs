//! Typed push-stream subscriptions.
//!
//! Each request type maps onto a `listen` frame: the request body becomes
//! `data`, the topic travels as a top-level `stream` field and
//! [`StreamOptions`] fields are added next to it only when set.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{LishiError, Result};
use crate::stream::codec::{EnvelopeKind, InboundEnvelope, RegistrationSpec};
use crate::stream::registry::{terminal_error, RegisterOptions, Stream, StreamHandler, StreamRegistry};

pub const TOPIC_ACTION_TRACES: &str = "action_traces";
pub const TOPIC_TABLE_ROWS: &str = "table_rows";
pub const TOPIC_TRANSACTION: &str = "transaction";
pub const TOPIC_HEAD_INFO: &str = "head_info";

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_true() -> bool {
    true
}

/// Action traces filtered by contract account, receiver and action name.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionTracesRequest {
    pub accounts: Vec<String>,
    /// Defaults server-side to `accounts` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receivers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_dbops: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_ramops: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_tableops: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_inline_traces: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub with_dtrxops: bool,
}

impl ActionTracesRequest {
    pub fn for_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accounts: accounts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_action_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_receivers<I, S>(mut self, receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.receivers = Some(receivers.into_iter().map(Into::into).collect());
        self
    }
}

/// Table row changes for one `code`/`scope`/`table` triple.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TableRowsRequest {
    pub code: String,
    pub scope: String,
    pub table: String,
    /// Decode rows to JSON using the ABI active at each block.
    #[serde(default = "default_true")]
    pub json: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<String>,
}

impl TableRowsRequest {
    pub fn new(code: impl Into<String>, scope: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            scope: scope.into(),
            table: table.into(),
            json: true,
            lower_bound: None,
            upper_bound: None,
        }
    }
}

/// Life cycle of a single transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionLifecycleRequest {
    pub id: String,
}

/// Options shared by every push stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamOptions {
    /// Stream id; generated when unset.
    pub req_id: Option<String>,
    pub fetch: Option<bool>,
    pub listen: Option<bool>,
    /// Absolute block number, or negative for relative to head.
    pub start_block: Option<i64>,
    pub irreversible_only: Option<bool>,
    /// Emit a progress message every N blocks.
    pub with_progress: Option<u32>,
    pub restart_on_error: Option<bool>,
}

impl StreamOptions {
    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }

    pub fn with_start_block(mut self, start_block: i64) -> Self {
        self.start_block = Some(start_block);
        self
    }

    pub fn with_progress(mut self, every_blocks: u32) -> Self {
        self.with_progress = Some(every_blocks);
        self
    }

    pub fn with_restart_on_error(mut self, enabled: bool) -> Self {
        self.restart_on_error = Some(enabled);
        self
    }

    fn apply(&self, mut spec: RegistrationSpec) -> RegistrationSpec {
        if let Some(fetch) = self.fetch {
            spec = spec.with_extra("fetch", json!(fetch));
        }
        if let Some(listen) = self.listen {
            spec = spec.with_extra("listen", json!(listen));
        }
        if let Some(start_block) = self.start_block {
            spec = spec.with_extra("start_block", json!(start_block));
        }
        if let Some(irreversible_only) = self.irreversible_only {
            spec = spec.with_extra("irreversible_only", json!(irreversible_only));
        }
        if let Some(with_progress) = self.with_progress {
            spec = spec.with_extra("with_progress", json!(with_progress));
        }
        spec
    }

    fn register_options(&self) -> RegisterOptions {
        RegisterOptions {
            id: self.req_id.clone(),
            restart_on_terminal_error: self.restart_on_error,
            marker: None,
        }
    }
}

/// Message delivered to push-stream handlers.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    /// Wire `type`, e.g. `action_trace`, `table_delta`, `progress`, `error`.
    pub kind: String,
    pub req_id: String,
    pub data: Value,
    terminal_error: bool,
}

impl InboundMessage {
    fn from_envelope(envelope: &InboundEnvelope) -> Self {
        Self {
            kind: envelope.tag.clone(),
            req_id: envelope.stream_id.clone(),
            data: envelope.payload.clone(),
            terminal_error: matches!(envelope.kind, EnvelopeKind::Error { terminal: true }),
        }
    }

    /// The error carried by an `error` message.
    pub fn error(&self) -> Option<LishiError> {
        self.terminal_error.then(|| terminal_error(&self.data))
    }

    /// Decodes `data` into a typed payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(LishiError::from)
    }
}

/// Push-stream facade over a [`StreamRegistry`] speaking the push codec.
#[derive(Clone)]
pub struct PushStreamClient {
    registry: StreamRegistry,
}

impl PushStreamClient {
    pub fn new(registry: StreamRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub async fn stream_action_traces<F>(
        &self,
        request: ActionTracesRequest,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        if request.accounts.is_empty() {
            return Err(LishiError::Client(
                "action traces require at least one account".to_string(),
            ));
        }
        let data = serde_json::to_value(&request)?;
        self.start(Some(TOPIC_ACTION_TRACES), data, on_message, options)
            .await
    }

    pub async fn stream_table_rows<F>(
        &self,
        request: TableRowsRequest,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        let data = serde_json::to_value(&request)?;
        self.start(Some(TOPIC_TABLE_ROWS), data, on_message, options)
            .await
    }

    pub async fn stream_transaction<F>(
        &self,
        request: TransactionLifecycleRequest,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        let data = serde_json::to_value(&request)?;
        self.start(Some(TOPIC_TRANSACTION), data, on_message, options)
            .await
    }

    pub async fn stream_head_info<F>(&self, on_message: F, options: StreamOptions) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        self.start(Some(TOPIC_HEAD_INFO), json!({}), on_message, options)
            .await
    }

    /// Registers a caller-built frame as-is. No topic field is added.
    pub async fn websocket_stream<F>(
        &self,
        spec: RegistrationSpec,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        let spec = options.apply(spec);
        self.registry
            .register(spec, wrap_handler(on_message), options.register_options())
            .await
    }

    async fn start<F>(
        &self,
        topic: Option<&str>,
        data: Value,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        let mut spec = RegistrationSpec::new(data);
        if let Some(topic) = topic {
            spec = spec.with_extra("stream", json!(topic));
        }
        self.websocket_stream(spec, on_message, options).await
    }
}

fn wrap_handler<F>(on_message: F) -> StreamHandler
where
    F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
{
    Arc::new(move |stream, envelope| {
        on_message(stream, &InboundMessage::from_envelope(envelope));
    })
}
