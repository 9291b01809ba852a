//! Envelope codecs.
//!
//! A codec turns registration requests into outbound frames and classifies
//! inbound frames into [`InboundEnvelope`]s. The transport only uses it for
//! framing (handshake, control frames); stream semantics live in the
//! registry.

use secrecy::ExposeSecret;
use serde_json::{json, Map, Value};

use crate::auth::AccessToken;
use crate::error::{LishiError, Result};
use crate::stream::proto::{
    GraphqlClientMessage, GraphqlRequest, GraphqlServerFrame, PushFrame, GQL_COMPLETE,
    GQL_CONNECTION_ACK, GQL_CONNECTION_ERROR, GQL_DATA, GQL_ERROR, GQL_KEEP_ALIVE, PUSH_ERROR,
    PUSH_LISTEN, PUSH_LISTENING, PUSH_PING, PUSH_PROGRESS, PUSH_UNLISTEN, PUSH_UNLISTENED,
};

/// Resume position supplied by the service for a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Resume at this block number.
    BlockNum(u64),
    /// Resume from an opaque cursor.
    Cursor(String),
}

/// Protocol-agnostic description of what a stream registers for.
///
/// `payload` is the request body (`data` for push streams, the GraphQL
/// operation for subscriptions); `extras` are extra top-level frame fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrationSpec {
    pub payload: Value,
    pub extras: Map<String, Value>,
}

impl RegistrationSpec {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            extras: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Connection-level frames that never reach a stream handler.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlFrame {
    ConnectionAck,
    KeepAlive,
    ConnectionError(Value),
    Other(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnvelopeKind {
    Data,
    /// Stream-scoped service notice (`listening`, `progress`): delivered to
    /// the handler but not counted as data.
    Notice,
    Error { terminal: bool },
    Complete,
    ControlOther(ControlFrame),
}

/// Decoded inbound frame. `tag` is the raw wire `type`.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEnvelope {
    pub stream_id: String,
    pub kind: EnvelopeKind,
    pub tag: String,
    pub payload: Value,
}

impl InboundEnvelope {
    pub fn is_control(&self) -> bool {
        matches!(self.kind, EnvelopeKind::ControlOther(_))
    }

    fn control(tag: String, frame: ControlFrame, stream_id: Option<String>, payload: Value) -> Self {
        Self {
            stream_id: stream_id.unwrap_or_default(),
            kind: EnvelopeKind::ControlOther(frame),
            tag,
            payload,
        }
    }
}

pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode_register(
        &self,
        id: &str,
        spec: &RegistrationSpec,
        marker: Option<&Marker>,
    ) -> Result<String>;

    fn encode_unregister(&self, id: &str) -> Result<String>;

    fn decode(&self, raw: &str) -> Result<InboundEnvelope>;

    /// Frame sent right after connecting; the transport then waits for
    /// [`ControlFrame::ConnectionAck`] before reporting the connection open.
    fn connection_init(&self, _token: &AccessToken) -> Option<String> {
        None
    }

    /// Frame sent before a graceful close.
    fn connection_terminate(&self) -> Option<String> {
        None
    }
}

/// Flat `{type, req_id, data}` push-stream encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct PushCodec;

impl EnvelopeCodec for PushCodec {
    fn encode_register(
        &self,
        id: &str,
        spec: &RegistrationSpec,
        marker: Option<&Marker>,
    ) -> Result<String> {
        let mut extras = spec.extras.clone();
        match marker {
            Some(Marker::BlockNum(block)) => {
                extras.insert("start_block".to_string(), json!(block));
            }
            Some(Marker::Cursor(cursor)) => {
                extras.insert("cursor".to_string(), json!(cursor));
            }
            None => {}
        }

        let frame = PushFrame {
            kind: PUSH_LISTEN.to_string(),
            req_id: Some(id.to_string()),
            data: Some(spec.payload.clone()),
            extras,
        };
        Ok(frame.to_text()?)
    }

    fn encode_unregister(&self, id: &str) -> Result<String> {
        let frame = PushFrame {
            kind: PUSH_UNLISTEN.to_string(),
            req_id: Some(id.to_string()),
            data: Some(json!({ "req_id": id })),
            extras: Map::new(),
        };
        Ok(frame.to_text()?)
    }

    fn decode(&self, raw: &str) -> Result<InboundEnvelope> {
        let frame = PushFrame::from_text(raw)?;
        let payload = frame.data.unwrap_or(Value::Null);

        let stream_id = match frame.req_id {
            Some(id) if frame.kind != PUSH_PING => id,
            stream_id => {
                let control = if frame.kind == PUSH_PING {
                    ControlFrame::KeepAlive
                } else {
                    ControlFrame::Other(frame.kind.clone())
                };
                return Ok(InboundEnvelope::control(frame.kind, control, stream_id, payload));
            }
        };

        let kind = match frame.kind.as_str() {
            PUSH_ERROR => EnvelopeKind::Error { terminal: true },
            PUSH_UNLISTENED => EnvelopeKind::Complete,
            PUSH_LISTENING | PUSH_PROGRESS => EnvelopeKind::Notice,
            _ => EnvelopeKind::Data,
        };

        Ok(InboundEnvelope {
            stream_id,
            kind,
            tag: frame.kind,
            payload,
        })
    }
}

/// `{id, type, payload}` GraphQL subscription encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphqlCodec;

impl GraphqlCodec {
    fn request_from_spec(spec: &RegistrationSpec, marker: Option<&Marker>) -> Result<GraphqlRequest> {
        let mut request: GraphqlRequest = serde_json::from_value(spec.payload.clone())
            .map_err(|err| LishiError::Client(format!("invalid graphql registration: {err}")))?;

        if let Some(marker) = marker {
            let mut variables = match request.variables.take() {
                Some(Value::Object(map)) => map,
                Some(Value::Null) | None => Map::new(),
                Some(other) => {
                    return Err(LishiError::Client(format!(
                        "graphql variables must be an object, got {other}"
                    )))
                }
            };
            match marker {
                Marker::Cursor(cursor) => variables.insert("cursor".to_string(), json!(cursor)),
                Marker::BlockNum(block) => variables.insert("lowBlockNum".to_string(), json!(block)),
            };
            request.variables = Some(Value::Object(variables));
        }

        Ok(request)
    }
}

impl EnvelopeCodec for GraphqlCodec {
    fn encode_register(
        &self,
        id: &str,
        spec: &RegistrationSpec,
        marker: Option<&Marker>,
    ) -> Result<String> {
        let message = GraphqlClientMessage::Start {
            id: id.to_string(),
            payload: Self::request_from_spec(spec, marker)?,
        };
        Ok(message.to_text()?)
    }

    fn encode_unregister(&self, id: &str) -> Result<String> {
        let message = GraphqlClientMessage::Stop { id: id.to_string() };
        Ok(message.to_text()?)
    }

    fn decode(&self, raw: &str) -> Result<InboundEnvelope> {
        let frame = GraphqlServerFrame::from_text(raw)?;
        let payload = frame.payload.unwrap_or(Value::Null);
        let tag = frame.kind;

        let (stream_id, kind) = match (tag.as_str(), frame.id) {
            (GQL_DATA, Some(id)) => {
                let has_errors = payload
                    .get("errors")
                    .and_then(Value::as_array)
                    .is_some_and(|errors| !errors.is_empty());
                let kind = if has_errors {
                    EnvelopeKind::Error { terminal: false }
                } else {
                    EnvelopeKind::Data
                };
                (id, kind)
            }
            (GQL_ERROR, Some(id)) => (id, EnvelopeKind::Error { terminal: true }),
            (GQL_COMPLETE, Some(id)) => (id, EnvelopeKind::Complete),
            (GQL_CONNECTION_ACK, id) => {
                return Ok(InboundEnvelope::control(
                    tag.clone(),
                    ControlFrame::ConnectionAck,
                    id,
                    payload,
                ))
            }
            (GQL_KEEP_ALIVE, id) => {
                return Ok(InboundEnvelope::control(
                    tag.clone(),
                    ControlFrame::KeepAlive,
                    id,
                    payload,
                ))
            }
            (GQL_CONNECTION_ERROR, id) => {
                let control = ControlFrame::ConnectionError(payload.clone());
                return Ok(InboundEnvelope::control(tag.clone(), control, id, payload));
            }
            (_, id) => {
                let control = ControlFrame::Other(tag.clone());
                return Ok(InboundEnvelope::control(tag.clone(), control, id, payload));
            }
        };

        Ok(InboundEnvelope {
            stream_id,
            kind,
            tag,
            payload,
        })
    }

    fn connection_init(&self, token: &AccessToken) -> Option<String> {
        let message = GraphqlClientMessage::ConnectionInit {
            payload: json!({
                "Authorization": format!("Bearer {}", token.secret().expose_secret()),
            }),
        };
        message.to_text().ok()
    }

    fn connection_terminate(&self) -> Option<String> {
        GraphqlClientMessage::ConnectionTerminate.to_text().ok()
    }
}
