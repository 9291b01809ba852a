//! GraphQL over HTTP (queries, mutations) and websocket (subscriptions).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LishiError, Result};
use crate::http::{ApiClient, ApiRequest};
use crate::stream::codec::{EnvelopeKind, InboundEnvelope, Marker, RegistrationSpec};
use crate::stream::proto::GraphqlRequest;
use crate::stream::registry::{RegisterOptions, Stream, StreamHandler, StreamRegistry};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationType {
    Query,
    Mutation,
    Subscription,
}

/// One entry of a GraphQL `errors` array.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphqlError>>,
}

/// Message delivered to subscription handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphqlStreamMessage {
    Data(Value),
    /// `terminal` errors end the stream unless it restarts.
    Error {
        errors: Vec<GraphqlError>,
        terminal: bool,
    },
    Complete,
}

impl GraphqlStreamMessage {
    fn from_envelope(envelope: &InboundEnvelope) -> Option<Self> {
        match &envelope.kind {
            EnvelopeKind::Data => Some(Self::Data(
                envelope.payload.get("data").cloned().unwrap_or(Value::Null),
            )),
            EnvelopeKind::Error { terminal } => Some(Self::Error {
                errors: errors_from_payload(&envelope.payload),
                terminal: *terminal,
            }),
            EnvelopeKind::Complete => Some(Self::Complete),
            EnvelopeKind::Notice | EnvelopeKind::ControlOther(_) => None,
        }
    }
}

/// Options for [`GraphqlClient::subscribe`].
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    pub id: Option<String>,
    pub restart_on_error: Option<bool>,
    /// Resume cursor, sent as `variables.cursor`.
    pub cursor: Option<String>,
}

impl SubscribeOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_restart_on_error(mut self, enabled: bool) -> Self {
        self.restart_on_error = Some(enabled);
        self
    }
}

/// GraphQL facade.
///
/// The HTTP client's base URL is the GraphQL query endpoint itself;
/// subscriptions go through a registry speaking the GraphQL codec.
#[derive(Clone)]
pub struct GraphqlClient {
    http: ApiClient,
    registry: StreamRegistry,
}

impl GraphqlClient {
    pub fn new(http: ApiClient, registry: StreamRegistry) -> Self {
        Self { http, registry }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Runs a query or mutation as a single request.
    pub async fn query<T>(
        &self,
        document: &str,
        variables: Option<Value>,
    ) -> Result<GraphqlResponse<T>>
    where
        T: DeserializeOwned,
    {
        let operation = infer_operation_type(document);
        if operation == Some(OperationType::Subscription) {
            return Err(LishiError::Client(
                "subscriptions must go through subscribe()".to_string(),
            ));
        }
        let body = serde_json::to_value(GraphqlRequest {
            query: document.to_string(),
            variables,
            operation_name: None,
        })?;
        self.http
            .api_request(
                ApiRequest::post("")
                    .with_idempotent(operation == Some(OperationType::Query))
                    .with_body(body),
            )
            .await
    }

    /// Starts a subscription over the shared GraphQL websocket.
    pub async fn subscribe<F>(
        &self,
        document: &str,
        variables: Option<Value>,
        on_message: F,
        options: SubscribeOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &GraphqlStreamMessage) + Send + Sync + 'static,
    {
        let payload = serde_json::to_value(GraphqlRequest {
            query: document.to_string(),
            variables,
            operation_name: None,
        })?;
        let handler: StreamHandler = Arc::new(move |stream, envelope| {
            if let Some(message) = GraphqlStreamMessage::from_envelope(envelope) {
                on_message(stream, &message);
            }
        });
        let register = RegisterOptions {
            id: options.id,
            restart_on_terminal_error: options.restart_on_error,
            marker: options.cursor.map(Marker::Cursor),
        };
        self.registry
            .register(RegistrationSpec::new(payload), handler, register)
            .await
    }
}

fn errors_from_payload(payload: &Value) -> Vec<GraphqlError> {
    let list = match payload {
        Value::Array(_) => Some(payload),
        Value::Object(map) => map.get("errors"),
        _ => None,
    };
    if let Some(list) = list {
        if let Ok(errors) = Vec::<GraphqlError>::deserialize(list) {
            return errors;
        }
    }
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| payload.to_string(), str::to_string);
    vec![GraphqlError {
        message,
        ..GraphqlError::default()
    }]
}

/// Classifies a GraphQL document by its first operation definition.
///
/// Fragment definitions are skipped; a bare selection set (`{ ... }`) is a
/// query. Returns `None` when no operation is found.
pub fn infer_operation_type(document: &str) -> Option<OperationType> {
    let mut chars = document.chars().peekable();
    loop {
        skip_ignored(&mut chars);
        match chars.peek().copied()? {
            '{' => return Some(OperationType::Query),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "query" => return Some(OperationType::Query),
                    "mutation" => return Some(OperationType::Mutation),
                    "subscription" => return Some(OperationType::Subscription),
                    _ => skip_definition(&mut chars),
                }
            }
            _ => {
                chars.next();
            }
        }
    }
}

fn skip_ignored<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    while let Some(&c) = chars.peek() {
        if c == '#' {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
        } else if c.is_whitespace() || c == ',' {
            chars.next();
        } else {
            return;
        }
    }
}

/// Consumes the rest of a definition up to its closing brace.
fn skip_definition<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for c in chars.by_ref() {
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}
