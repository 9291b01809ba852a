//! Logical stream multiplexing over one [`Transport`].
//!
//! The registry owns every stream record: its handler, registration spec,
//! resume marker and restart policy. A dispatch task consumes the
//! transport's ordered event channel, routes envelopes to handlers and
//! replays registrations whenever the transport reports `Opened`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{ApiErrorData, LishiError, Result};
use crate::retry::BackoffPolicy;
use crate::stream::codec::{EnvelopeCodec, EnvelopeKind, InboundEnvelope, Marker, RegistrationSpec};
use crate::stream::transport::{LifecycleEvent, Transport, TransportEvent, TransportEvents};

const REGISTER_SEND_ATTEMPTS: u32 = 3;
const SOCKET_ERROR_CODE: &str = "socket_error";

/// Callback invoked for every envelope routed to a stream.
///
/// Runs on the dispatch task; it must not block.
pub type StreamHandler = Arc<dyn Fn(&Stream, &InboundEnvelope) + Send + Sync>;

type Outcome = Option<Result<()>>;

/// Produces stream ids when the caller does not supply one.
pub trait IdGenerator: Send + Sync + 'static {
    fn next_id(&self) -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Pending,
    Active,
    Closed,
}

#[derive(Clone)]
pub struct RegistryConfig {
    /// Default for streams that do not override it at registration.
    pub restart_on_terminal_error: bool,
    /// Delay between consecutive restarts; `max_attempts` caps them.
    pub restart_backoff: BackoffPolicy,
    pub id_generator: Arc<dyn IdGenerator>,
}

impl RegistryConfig {
    pub fn with_restart_on_terminal_error(mut self, enabled: bool) -> Self {
        self.restart_on_terminal_error = enabled;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = ids;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            restart_on_terminal_error: false,
            restart_backoff: BackoffPolicy::reconnect(),
            id_generator: Arc::new(UuidIdGenerator),
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("restart_on_terminal_error", &self.restart_on_terminal_error)
            .field("restart_backoff", &self.restart_backoff)
            .finish_non_exhaustive()
    }
}

/// Per-registration options.
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    pub id: Option<String>,
    /// Overrides [`RegistryConfig::restart_on_terminal_error`].
    pub restart_on_terminal_error: Option<bool>,
    /// Initial resume position.
    pub marker: Option<Marker>,
}

impl RegisterOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_restart_on_terminal_error(mut self, enabled: bool) -> Self {
        self.restart_on_terminal_error = Some(enabled);
        self
    }

    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.marker = Some(marker);
        self
    }
}

struct StreamRecord {
    serial: u64,
    state: StreamState,
    handler: StreamHandler,
    spec: RegistrationSpec,
    marker: Option<Marker>,
    restart_on_terminal_error: bool,
    restarts: u32,
    sent_epoch: Option<u64>,
    closed: watch::Sender<Outcome>,
}

impl StreamRecord {
    fn close(self, outcome: Result<()>) {
        self.closed.send_replace(Some(outcome));
    }
}

struct RegistryInner {
    transport: Transport,
    codec: Arc<dyn EnvelopeCodec>,
    config: RegistryConfig,
    records: Mutex<HashMap<String, StreamRecord>>,
    epoch: Mutex<u64>,
    serials: AtomicU64,
}

impl RegistryInner {
    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, StreamRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn encode_current(&self, id: &str, record: &StreamRecord) -> Result<String> {
        self.codec
            .encode_register(id, &record.spec, record.marker.as_ref())
    }

    fn set_sent_epoch(&self, id: &str, serial: u64, epoch: u64) {
        if let Some(record) = self.lock_records().get_mut(id) {
            if record.serial == serial {
                record.sent_epoch = Some(epoch);
            }
        }
    }
}

/// Registry of logical streams sharing one transport.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    /// Takes ownership of the transport's event channel and starts dispatch.
    pub fn new(transport: Transport, events: TransportEvents, config: RegistryConfig) -> Self {
        let codec = transport.codec();
        let inner = Arc::new(RegistryInner {
            transport,
            codec,
            config,
            records: Mutex::new(HashMap::new()),
            epoch: Mutex::new(0),
            serials: AtomicU64::new(0),
        });
        tokio::spawn(run_dispatch(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Registers a stream and sends its registration frame.
    ///
    /// Opens the transport if needed. Resolves once the frame is written;
    /// the stream is `Active` from then on and is replayed on every
    /// reconnect until it closes.
    pub async fn register(
        &self,
        spec: RegistrationSpec,
        handler: StreamHandler,
        options: RegisterOptions,
    ) -> Result<Stream> {
        let inner = &self.inner;
        let id = match options.id {
            Some(id) if id.is_empty() => {
                return Err(LishiError::Client("stream id must not be empty".to_string()));
            }
            Some(id) => id,
            None => inner.config.id_generator.next_id(),
        };
        let frame = inner
            .codec
            .encode_register(&id, &spec, options.marker.as_ref())?;
        let serial = inner.serials.fetch_add(1, Ordering::Relaxed);

        let closed = {
            let mut records = inner.lock_records();
            if records.contains_key(&id) {
                return Err(LishiError::Client(format!("stream `{id}` is already registered")));
            }
            let (closed_tx, closed_rx) = watch::channel(None);
            records.insert(
                id.clone(),
                StreamRecord {
                    serial,
                    state: StreamState::Pending,
                    handler,
                    spec,
                    marker: options.marker,
                    restart_on_terminal_error: options
                        .restart_on_terminal_error
                        .unwrap_or(inner.config.restart_on_terminal_error),
                    restarts: 0,
                    sent_epoch: None,
                    closed: closed_tx,
                },
            );
            closed_rx
        };
        let stream = Stream {
            id: id.clone(),
            registry: self.clone(),
            closed,
        };

        let epoch = match self.send_registration(&frame).await {
            Ok(epoch) => epoch,
            Err(err) => {
                let mut records = inner.lock_records();
                if records.get(&id).is_some_and(|record| record.serial == serial) {
                    if let Some(record) = records.remove(&id) {
                        record.close(Err(err.clone()));
                    }
                }
                return Err(err);
            }
        };

        enum Activation {
            Done,
            Resend(String),
            LateUnregister,
        }

        let activation = {
            let mut records = inner.lock_records();
            match records.get_mut(&id) {
                Some(record) if record.serial == serial => {
                    record.state = StreamState::Active;
                    record.sent_epoch = Some(epoch);
                    if inner.current_epoch() > epoch {
                        Activation::Resend(inner.encode_current(&id, record)?)
                    } else {
                        Activation::Done
                    }
                }
                _ => Activation::LateUnregister,
            }
        };

        match activation {
            Activation::Done => {}
            Activation::Resend(frame) => {
                debug!(event = "stream_register_resend", stream_id = %id, epoch);
                match inner.transport.send(frame).await {
                    Ok(epoch) => inner.set_sent_epoch(&id, serial, epoch),
                    Err(err) => {
                        debug!(event = "stream_register_resend_failed", stream_id = %id, error = %err)
                    }
                }
            }
            Activation::LateUnregister => {
                debug!(event = "stream_late_unregister", stream_id = %id);
                let frame = inner.codec.encode_unregister(&id)?;
                if let Err(err) = inner.transport.send(frame).await {
                    debug!(event = "stream_unregister_send_failed", stream_id = %id, error = %err);
                }
            }
        }

        debug!(event = "stream_registered", stream_id = %id);
        Ok(stream)
    }

    async fn send_registration(&self, frame: &str) -> Result<u64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.inner.transport.open().await?;
            match self.inner.transport.send(frame.to_string()).await {
                Ok(epoch) => return Ok(epoch),
                Err(err) if err.is_retryable() && attempt < REGISTER_SEND_ATTEMPTS => {
                    debug!(event = "stream_register_send_retry", attempt, error = %err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Removes the stream locally and, if it was active, tells the server.
    ///
    /// Idempotent. Send failures are logged, never returned.
    pub async fn unregister(&self, id: &str) {
        let Some(record) = self.inner.lock_records().remove(id) else {
            trace!(event = "stream_unregister_unknown", stream_id = %id);
            return;
        };
        let was_active = record.state == StreamState::Active;
        record.close(Ok(()));

        if !was_active {
            return;
        }
        let frame = match self.inner.codec.encode_unregister(id) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "stream_unregister_encode_failed", stream_id = %id, error = %err);
                return;
            }
        };
        if let Err(err) = self.inner.transport.send(frame).await {
            debug!(event = "stream_unregister_send_failed", stream_id = %id, error = %err);
        }
        debug!(event = "stream_unregistered", stream_id = %id);
    }

    /// Records the last acknowledged position of a stream.
    pub fn mark(&self, id: &str, marker: Marker) -> Result<()> {
        let mut records = self.inner.lock_records();
        let record = records
            .get_mut(id)
            .ok_or_else(|| LishiError::Client(format!("unknown stream `{id}`")))?;
        record.marker = Some(marker);
        Ok(())
    }

    /// Re-sends the registration of an active stream, optionally moving its marker.
    pub async fn restart(&self, id: &str, marker: Option<Marker>) -> Result<()> {
        let (serial, frame) = {
            let mut records = self.inner.lock_records();
            let record = records
                .get_mut(id)
                .filter(|record| record.state == StreamState::Active)
                .ok_or_else(|| LishiError::Client(format!("stream `{id}` is not active")))?;
            if marker.is_some() {
                record.marker = marker;
            }
            record.sent_epoch = None;
            (record.serial, self.inner.encode_current(id, record)?)
        };

        let epoch = self.inner.transport.send(frame).await?;
        self.inner.set_sent_epoch(id, serial, epoch);
        Ok(())
    }

    /// Resolves when the stream closes; unknown ids count as closed.
    pub async fn join(&self, id: &str) -> Result<()> {
        let closed = self
            .inner
            .lock_records()
            .get(id)
            .map(|record| record.closed.subscribe());
        match closed {
            Some(closed) => wait_closed(closed).await,
            None => Ok(()),
        }
    }

    pub fn state_of(&self, id: &str) -> StreamState {
        self.inner
            .lock_records()
            .get(id)
            .map_or(StreamState::Closed, |record| record.state)
    }

    /// Ids of active streams, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock_records()
            .iter()
            .filter(|(_, record)| record.state == StreamState::Active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn marker_of(&self, id: &str) -> Option<Marker> {
        self.inner
            .lock_records()
            .get(id)
            .and_then(|record| record.marker.clone())
    }

    /// Evicts every stream (joins resolve `Ok`) and closes the transport.
    pub fn release(&self) {
        let drained: Vec<StreamRecord> = self
            .inner
            .lock_records()
            .drain()
            .map(|(_, record)| record)
            .collect();
        if !drained.is_empty() {
            debug!(event = "registry_released", streams = drained.len());
        }
        for record in drained {
            record.close(Ok(()));
        }
        self.inner.transport.close();
    }
}

/// Handle to one registered stream.
#[derive(Clone)]
pub struct Stream {
    id: String,
    registry: StreamRegistry,
    closed: watch::Receiver<Outcome>,
}

impl Stream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> StreamState {
        self.registry.state_of(&self.id)
    }

    pub fn mark(&self, marker: Marker) -> Result<()> {
        self.registry.mark(&self.id, marker)
    }

    pub async fn restart(&self, marker: Option<Marker>) -> Result<()> {
        self.registry.restart(&self.id, marker).await
    }

    pub async fn close(&self) {
        self.registry.unregister(&self.id).await;
    }

    pub async fn join(&self) -> Result<()> {
        wait_closed(self.closed.clone()).await
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_closed(mut closed: watch::Receiver<Outcome>) -> Result<()> {
    match closed.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(LishiError::socket("stream registry dropped")),
    }
}

async fn run_dispatch(registry: Weak<RegistryInner>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Lifecycle(LifecycleEvent::Opened { epoch, .. }) => {
                replay(&inner, epoch).await;
            }
            TransportEvent::Lifecycle(LifecycleEvent::Closed { reason }) => {
                if reason.is_terminal() {
                    fail_active(&inner, &reason.describe());
                }
            }
            TransportEvent::Envelope(envelope) => route(&inner, envelope),
        }
    }
    trace!(event = "registry_dispatch_stopped");
}

/// Re-sends every active registration not yet sent on `epoch`.
async fn replay(inner: &Arc<RegistryInner>, epoch: u64) {
    *inner.epoch.lock().unwrap_or_else(PoisonError::into_inner) = epoch;

    let frames: Vec<(String, u64, String)> = {
        let records = inner.lock_records();
        records
            .iter()
            .filter(|(_, record)| {
                record.state == StreamState::Active && record.sent_epoch != Some(epoch)
            })
            .filter_map(|(id, record)| match inner.encode_current(id, record) {
                Ok(frame) => Some((id.clone(), record.serial, frame)),
                Err(err) => {
                    warn!(event = "stream_replay_encode_failed", stream_id = %id, error = %err);
                    None
                }
            })
            .collect()
    };
    if frames.is_empty() {
        return;
    }
    debug!(event = "stream_replay", epoch, streams = frames.len());

    let sends = frames.into_iter().map(|(id, serial, frame)| async move {
        match inner.transport.send(frame).await {
            Ok(sent_on) => inner.set_sent_epoch(&id, serial, sent_on),
            Err(err) => warn!(event = "stream_replay_failed", stream_id = %id, error = %err),
        }
    });
    join_all(sends).await;
}

fn route(inner: &Arc<RegistryInner>, envelope: InboundEnvelope) {
    if envelope.is_control() {
        return;
    }

    let target = {
        let mut records = inner.lock_records();
        records.get_mut(&envelope.stream_id).map(|record| {
            if envelope.kind == EnvelopeKind::Data {
                record.restarts = 0;
            }
            (
                record.serial,
                Arc::clone(&record.handler),
                record.closed.subscribe(),
            )
        })
    };
    let Some((serial, handler, closed)) = target else {
        trace!(event = "stream_envelope_unmatched", stream_id = %envelope.stream_id, tag = %envelope.tag);
        return;
    };

    let stream = Stream {
        id: envelope.stream_id.clone(),
        registry: StreamRegistry {
            inner: Arc::clone(inner),
        },
        closed,
    };
    handler(&stream, &envelope);

    match envelope.kind {
        EnvelopeKind::Complete => {
            evict(inner, &envelope.stream_id, serial, Ok(()));
            debug!(event = "stream_completed", stream_id = %envelope.stream_id);
        }
        EnvelopeKind::Error { terminal: true } => {
            on_terminal_error(inner, &envelope.stream_id, serial, &envelope.payload);
        }
        EnvelopeKind::Data
        | EnvelopeKind::Notice
        | EnvelopeKind::Error { terminal: false }
        | EnvelopeKind::ControlOther(_) => {}
    }
}

fn evict(inner: &RegistryInner, id: &str, serial: u64, outcome: Result<()>) {
    let mut records = inner.lock_records();
    if records.get(id).is_some_and(|record| record.serial == serial) {
        if let Some(record) = records.remove(id) {
            record.close(outcome);
        }
    }
}

fn on_terminal_error(inner: &Arc<RegistryInner>, id: &str, serial: u64, payload: &Value) {
    let policy = &inner.config.restart_backoff;
    let restart_attempt = {
        let mut records = inner.lock_records();
        match records.get_mut(id) {
            Some(record)
                if record.serial == serial
                    && record.restart_on_terminal_error
                    && policy.allows_attempt(record.restarts) =>
            {
                record.restarts += 1;
                record.sent_epoch = None;
                Some(record.restarts)
            }
            _ => None,
        }
    };

    let Some(attempt) = restart_attempt else {
        let error = terminal_error(payload);
        debug!(event = "stream_terminated", stream_id = %id, error = %error);
        evict(inner, id, serial, Err(error));
        return;
    };

    let delay = if attempt <= 1 {
        Duration::ZERO
    } else {
        policy.delay_for_attempt(attempt - 2)
    };
    debug!(
        event = "stream_restart_scheduled",
        stream_id = %id,
        attempt,
        delay_ms = delay.as_millis() as u64
    );
    tokio::spawn(restart_after(Arc::downgrade(inner), id.to_string(), serial, delay));
}

async fn restart_after(registry: Weak<RegistryInner>, id: String, serial: u64, delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let Some(inner) = registry.upgrade() else {
        return;
    };

    let frame = {
        let records = inner.lock_records();
        match records.get(&id) {
            // A reconnect during the delay already replayed it.
            Some(record) if record.serial == serial && record.sent_epoch.is_some() => {
                debug!(event = "stream_restart_superseded", stream_id = %id);
                return;
            }
            Some(record) if record.serial == serial => inner.encode_current(&id, record),
            _ => return,
        }
    };
    let result = match frame {
        Ok(frame) => inner.transport.send(frame).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(epoch) => {
            inner.set_sent_epoch(&id, serial, epoch);
            debug!(event = "stream_restarted", stream_id = %id, epoch);
        }
        // Left unsent; the next reconnect replays it.
        Err(err) => warn!(event = "stream_restart_failed", stream_id = %id, error = %err),
    }
}

/// Delivers a synthesized terminal socket error to every active stream.
fn fail_active(inner: &Arc<RegistryInner>, reason: &str) {
    let failed: Vec<(String, StreamRecord)> = {
        let mut records = inner.lock_records();
        let ids: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.state == StreamState::Active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| records.remove(&id).map(|record| (id, record)))
            .collect()
    };
    if failed.is_empty() {
        return;
    }
    warn!(event = "streams_failed", streams = failed.len(), reason);

    for (id, record) in failed {
        let envelope = InboundEnvelope {
            stream_id: id.clone(),
            kind: EnvelopeKind::Error { terminal: true },
            tag: "error".to_string(),
            payload: json!({ "code": SOCKET_ERROR_CODE, "message": reason }),
        };
        let stream = Stream {
            id,
            registry: StreamRegistry {
                inner: Arc::clone(inner),
            },
            closed: record.closed.subscribe(),
        };
        (record.handler)(&stream, &envelope);
        record.close(Err(LishiError::socket(reason)));
    }
}

/// Maps a terminal error payload onto the error taxonomy.
pub(crate) fn terminal_error(payload: &Value) -> LishiError {
    if let Ok(data) = serde_json::from_value::<ApiErrorData>(payload.clone()) {
        if data.code == SOCKET_ERROR_CODE {
            return LishiError::socket(data.message);
        }
        return LishiError::Api(data);
    }

    let first = match payload {
        Value::Array(errors) => errors.first(),
        Value::Object(map) => map
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .or(Some(payload)),
        _ => None,
    };
    let message = first
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    LishiError::Protocol(message)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Instant};

    use super::{
        terminal_error, IdGenerator, RegisterOptions, RegistryConfig, StreamHandler,
        StreamRegistry, StreamState,
    };
    use crate::error::LishiError;
    use crate::retry::BackoffPolicy;
    use crate::stream::codec::{
        EnvelopeCodec, EnvelopeKind, GraphqlCodec, InboundEnvelope, Marker, PushCodec,
        RegistrationSpec,
    };
    use crate::stream::transport::tests::{build_transport, test_backoff, MockConnector, MockPeer};

    struct Harness {
        registry: StreamRegistry,
        connector: Arc<MockConnector>,
        peers: mpsc::UnboundedReceiver<MockPeer>,
    }

    impl Harness {
        fn new(codec: Arc<dyn EnvelopeCodec>, backoff: BackoffPolicy, config: RegistryConfig) -> Self {
            let (transport, events, connector, peers) = build_transport(codec, backoff);
            Self {
                registry: StreamRegistry::new(transport, events, config),
                connector,
                peers,
            }
        }

        fn push() -> Self {
            Self::new(Arc::new(PushCodec), test_backoff(), RegistryConfig::default())
        }

        async fn peer(&mut self) -> MockPeer {
            timeout(Duration::from_secs(30), self.peers.recv())
                .await
                .expect("timed out waiting for connection")
                .expect("connector dropped")
        }
    }

    fn recording_handler() -> (StreamHandler, mpsc::UnboundedReceiver<InboundEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: StreamHandler = Arc::new(move |_stream, envelope| {
            let _ = tx.send(envelope.clone());
        });
        (handler, rx)
    }

    async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<InboundEnvelope>) -> InboundEnvelope {
        timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("handler dropped")
    }

    fn accounts_spec() -> RegistrationSpec {
        RegistrationSpec::new(json!({"accounts": ["eosio.token"]}))
    }

    fn with_id(id: &str) -> RegisterOptions {
        RegisterOptions::default().with_id(id)
    }

    #[tokio::test]
    async fn register_sends_listen_and_delivers_each_envelope_once() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();

        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        assert_eq!(stream.id(), "s1");
        assert_eq!(stream.state(), StreamState::Active);

        let mut peer = harness.peer().await;
        assert_eq!(
            peer.recv_json().await,
            json!({"type": "listen", "req_id": "s1", "data": {"accounts": ["eosio.token"]}})
        );

        peer.push_text(r#"{"type":"action_trace","req_id":"s1","data":{"block_num":10}}"#);
        peer.push_text(r#"{"type":"action_trace","req_id":"s1","data":{"block_num":11}}"#);

        let first = next_envelope(&mut received).await;
        assert_eq!(first.kind, EnvelopeKind::Data);
        assert_eq!(first.payload, json!({"block_num": 10}));
        let second = next_envelope(&mut received).await;
        assert_eq!(second.payload, json!({"block_num": 11}));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_without_replacing_handler() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();
        let (other, mut other_received) = recording_handler();

        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let err = harness
            .registry
            .register(accounts_spec(), other, with_id("s1"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, LishiError::Client(_)));

        let peer = harness.peer().await;
        peer.push_text(r#"{"type":"action_trace","req_id":"s1","data":1}"#);
        assert_eq!(next_envelope(&mut received).await.payload, json!(1));
        assert!(other_received.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_envelopes_are_dropped() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();

        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");

        let peer = harness.peer().await;
        peer.push_text(r#"{"type":"action_trace","req_id":"nobody","data":0}"#);
        peer.push_text(r#"{"type":"action_trace","req_id":"s1","data":1}"#);

        let envelope = next_envelope(&mut received).await;
        assert_eq!(envelope.stream_id, "s1");
        assert_eq!(envelope.payload, json!(1));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_twice_sends_a_single_unlisten() {
        let mut harness = Harness::push();
        let (handler, _received) = recording_handler();

        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        peer.recv().await;

        harness.registry.unregister("s1").await;
        harness.registry.unregister("s1").await;

        assert_eq!(
            peer.recv_json().await,
            json!({"type": "unlisten", "req_id": "s1", "data": {"req_id": "s1"}})
        );
        assert!(peer.try_recv().is_none());
        stream.join().await.expect("join after unregister");
        assert_eq!(harness.registry.state_of("s1"), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_active_streams_once_before_new_data() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();
        let (gone, _gone_received) = recording_handler();

        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register s1");
        harness
            .registry
            .register(accounts_spec(), gone, with_id("s2"))
            .await
            .expect("register s2");
        harness.registry.unregister("s2").await;
        harness
            .registry
            .mark("s1", Marker::BlockNum(42))
            .expect("mark");

        let mut first = harness.peer().await;
        for _ in 0..3 {
            first.recv().await;
        }
        first.disconnect();

        let mut second = harness.peer().await;
        let replayed = second.recv_json().await;
        assert_eq!(replayed["type"], "listen");
        assert_eq!(replayed["req_id"], "s1");
        assert_eq!(replayed["start_block"], 42);

        second.push_text(r#"{"type":"action_trace","req_id":"s1","data":"after"}"#);
        assert_eq!(next_envelope(&mut received).await.payload, json!("after"));
        assert!(second.try_recv().is_none());
        assert_eq!(harness.connector.connects(), 2);
    }

    #[tokio::test]
    async fn complete_closes_the_stream_and_resolves_join() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();

        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let peer = harness.peer().await;
        peer.push_text(r#"{"type":"unlistened","req_id":"s1","data":{"success":true}}"#);

        assert_eq!(next_envelope(&mut received).await.kind, EnvelopeKind::Complete);
        stream.join().await.expect("completed");
        assert!(harness.registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn terminal_error_without_restart_fails_join() {
        let mut harness = Harness::push();
        let (handler, mut received) = recording_handler();

        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let peer = harness.peer().await;
        peer.push_text(
            r#"{"type":"error","req_id":"s1","data":{"code":"stream_limit_error","message":"too many streams"}}"#,
        );

        let envelope = next_envelope(&mut received).await;
        assert_eq!(envelope.kind, EnvelopeKind::Error { terminal: true });
        match stream.join().await {
            Err(LishiError::Api(data)) => assert_eq!(data.code, "stream_limit_error"),
            other => panic!("unexpected join outcome: {other:?}"),
        }
        assert_eq!(harness.registry.state_of("s1"), StreamState::Closed);
    }

    #[tokio::test]
    async fn terminal_error_with_restart_resends_with_last_marker() {
        let config = RegistryConfig::default().with_restart_on_terminal_error(true);
        let mut harness = Harness::new(Arc::new(PushCodec), test_backoff(), config);
        let (handler, mut received) = recording_handler();

        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        harness
            .registry
            .mark("s1", Marker::Cursor("c:7".to_string()))
            .expect("mark");

        let mut peer = harness.peer().await;
        peer.recv().await;
        peer.push_text(r#"{"type":"error","req_id":"s1","data":{"code":"internal","message":"x"}}"#);
        next_envelope(&mut received).await;

        let resent = peer.recv_json().await;
        assert_eq!(resent["type"], "listen");
        assert_eq!(resent["cursor"], "c:7");
        assert_eq!(harness.registry.state_of("s1"), StreamState::Active);
    }

    #[tokio::test]
    async fn per_stream_override_disables_restart() {
        let config = RegistryConfig::default().with_restart_on_terminal_error(true);
        let mut harness = Harness::new(Arc::new(PushCodec), test_backoff(), config);
        let (handler, mut received) = recording_handler();

        let stream = harness
            .registry
            .register(
                accounts_spec(),
                handler,
                with_id("s1").with_restart_on_terminal_error(false),
            )
            .await
            .expect("register");
        let peer = harness.peer().await;
        peer.push_text(r#"{"type":"error","req_id":"s1","data":{"code":"internal","message":"x"}}"#);
        next_envelope(&mut received).await;

        assert!(stream.join().await.is_err());
    }

    fn restarting(base_delay: Duration, max_attempts: Option<u32>) -> Harness {
        let restart_backoff = BackoffPolicy {
            base_delay,
            max_delay: base_delay * 8,
            jitter_fraction: 0.0,
            max_attempts,
        };
        let config = RegistryConfig::default()
            .with_restart_on_terminal_error(true)
            .with_restart_backoff(restart_backoff);
        Harness::new(Arc::new(PushCodec), test_backoff(), config)
    }

    const STREAM_ERROR: &str =
        r#"{"type":"error","req_id":"s1","data":{"code":"internal","message":"x"}}"#;

    #[tokio::test(start_paused = true)]
    async fn consecutive_restarts_follow_the_restart_backoff() {
        let mut harness = restarting(Duration::from_secs(2), None);
        let (handler, mut received) = recording_handler();
        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        peer.recv().await;

        let start = Instant::now();
        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        assert_eq!(peer.recv_json().await["type"], "listen");
        assert!(start.elapsed() < Duration::from_secs(1));

        let start = Instant::now();
        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        assert_eq!(peer.recv_json().await["type"], "listen");
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2), "waited {waited:?}");
        assert!(waited < Duration::from_secs(3), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn data_resets_the_restart_counter() {
        let mut harness = restarting(Duration::from_secs(2), None);
        let (handler, mut received) = recording_handler();
        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        peer.recv().await;

        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        peer.recv().await;

        peer.push_text(r#"{"type":"listening","req_id":"s1","data":{}}"#);
        assert_eq!(next_envelope(&mut received).await.kind, EnvelopeKind::Notice);
        peer.push_text(r#"{"type":"action_trace","req_id":"s1","data":{"block_num":3}}"#);
        assert_eq!(next_envelope(&mut received).await.kind, EnvelopeKind::Data);

        let start = Instant::now();
        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        assert_eq!(peer.recv_json().await["type"], "listen");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn notices_do_not_reset_the_restart_counter() {
        let mut harness = restarting(Duration::from_secs(2), None);
        let (handler, mut received) = recording_handler();
        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        peer.recv().await;

        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        peer.recv().await;
        peer.push_text(r#"{"type":"listening","req_id":"s1","data":{}}"#);
        next_envelope(&mut received).await;

        let start = Instant::now();
        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        peer.recv().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cap_closes_the_stream_with_the_error() {
        let mut harness = restarting(Duration::from_millis(100), Some(1));
        let (handler, mut received) = recording_handler();
        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        peer.recv().await;

        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        assert_eq!(peer.recv_json().await["type"], "listen");

        peer.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        match stream.join().await {
            Err(LishiError::Api(data)) => assert_eq!(data.code, "internal"),
            other => panic!("unexpected join outcome: {other:?}"),
        }
        assert_eq!(harness.registry.state_of("s1"), StreamState::Closed);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_restart_is_dropped_when_reconnect_replays_first() {
        let mut harness = restarting(Duration::from_secs(5), None);
        let (handler, mut received) = recording_handler();
        harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut first = harness.peer().await;
        first.recv().await;

        first.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        first.recv().await;
        // Second consecutive error: the restart now waits 5s.
        first.push_text(STREAM_ERROR);
        next_envelope(&mut received).await;
        first.disconnect();

        let mut second = harness.peer().await;
        let replayed = second.recv_json().await;
        assert_eq!(replayed["type"], "listen");
        assert_eq!(replayed["req_id"], "s1");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(second.try_recv().is_none());
        assert_eq!(harness.registry.state_of("s1"), StreamState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_delivers_socket_error_to_active_streams() {
        let backoff = BackoffPolicy {
            max_attempts: Some(1),
            ..test_backoff()
        };
        let mut harness = Harness::new(Arc::new(PushCodec), backoff, RegistryConfig::default());
        let (handler, mut received) = recording_handler();

        let stream = harness
            .registry
            .register(accounts_spec(), handler, with_id("s1"))
            .await
            .expect("register");
        let mut peer = harness.peer().await;
        harness.connector.refuse_next(5);
        peer.disconnect();

        let envelope = next_envelope(&mut received).await;
        assert_eq!(envelope.kind, EnvelopeKind::Error { terminal: true });
        assert_eq!(envelope.payload["code"], "socket_error");
        assert!(matches!(stream.join().await, Err(LishiError::Socket { .. })));
        assert!(harness.registry.active_ids().is_empty());
    }

    #[tokio::test]
    async fn active_set_tracks_registrations() {
        let mut harness = Harness::push();
        for id in ["s1", "s2", "s3", "s4"] {
            let (handler, _) = recording_handler();
            harness
                .registry
                .register(accounts_spec(), handler, with_id(id))
                .await
                .expect("register");
        }
        harness.registry.unregister("s2").await;
        harness.registry.unregister("s4").await;
        harness.registry.unregister("missing").await;

        assert_eq!(harness.registry.active_ids(), vec!["s1", "s3"]);
        let _peer = harness.peer().await;
    }

    #[tokio::test]
    async fn mark_on_unknown_stream_is_a_client_error() {
        let harness = Harness::push();
        let err = harness
            .registry
            .mark("ghost", Marker::BlockNum(1))
            .expect_err("unknown");
        assert!(matches!(err, LishiError::Client(_)));
    }

    #[tokio::test]
    async fn unregister_while_pending_sends_late_stop() {
        let mut harness = Harness::new(
            Arc::new(GraphqlCodec),
            test_backoff(),
            RegistryConfig::default(),
        );
        let (handler, _received) = recording_handler();
        let spec = RegistrationSpec::new(json!({"query": "subscription { heads { num } }"}));

        let registering = tokio::spawn({
            let registry = harness.registry.clone();
            async move { registry.register(spec, handler, with_id("g1")).await }
        });

        let mut peer = harness.peer().await;
        assert_eq!(peer.recv_json().await["type"], "connection_init");
        assert_eq!(harness.registry.state_of("g1"), StreamState::Pending);

        harness.registry.unregister("g1").await;
        peer.push_text(r#"{"type":"connection_ack"}"#);

        let stream = registering.await.expect("join").expect("register");
        assert_eq!(peer.recv_json().await["type"], "start");
        assert_eq!(peer.recv_json().await, json!({"type": "stop", "id": "g1"}));
        stream.join().await.expect("already closed");
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn generated_ids_are_unique() {
        struct Sequential(std::sync::atomic::AtomicUsize);
        impl IdGenerator for Sequential {
            fn next_id(&self) -> String {
                let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                format!("gen-{n}")
            }
        }

        let config = RegistryConfig::default()
            .with_id_generator(Arc::new(Sequential(Default::default())));
        let harness = Harness::new(Arc::new(PushCodec), test_backoff(), config);
        let (a, _) = recording_handler();
        let (b, _) = recording_handler();

        let first = harness
            .registry
            .register(accounts_spec(), a, RegisterOptions::default())
            .await
            .expect("first");
        let second = harness
            .registry
            .register(accounts_spec(), b, RegisterOptions::default())
            .await
            .expect("second");
        assert_eq!(first.id(), "gen-0");
        assert_eq!(second.id(), "gen-1");
    }

    #[test]
    fn terminal_error_payloads_map_onto_taxonomy() {
        assert!(matches!(
            terminal_error(&json!({"code": "socket_error", "message": "gone"})),
            LishiError::Socket { .. }
        ));
        assert!(matches!(
            terminal_error(&json!({"code": "x", "message": "y"})),
            LishiError::Api(_)
        ));
        match terminal_error(&json!([{"message": "bad field"}])) {
            LishiError::Protocol(message) => assert_eq!(message, "bad field"),
            other => panic!("unexpected: {other:?}"),
        }
        match terminal_error(&Value::Null) {
            LishiError::Protocol(message) => assert_eq!(message, "null"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
