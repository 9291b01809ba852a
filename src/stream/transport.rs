//! Single shared websocket connection with reconnect-and-backoff.
//!
//! A background worker owns the physical socket. It (re)connects with the
//! freshest access token, runs the codec handshake, forwards decoded stream
//! envelopes and lifecycle events on one ordered channel, and writes
//! outbound frames on behalf of [`Transport::send`]. The transport knows
//! nothing about streams; replay after reconnect is driven by the registry
//! reacting to [`LifecycleEvent::Opened`].

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::auth::CredentialManager;
use crate::error::{LishiError, Result};
use crate::retry::{with_timeout, BackoffPolicy};
use crate::stream::codec::{ControlFrame, EnvelopeCodec, EnvelopeKind, InboundEnvelope};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIFECYCLE_CAPACITY: usize = 64;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = LishiError> + Send>>;
pub type FrameSource = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// What the transport hands a [`Connector`] for each connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub url: String,
    pub token: SecretString,
}

/// Establishes the physical connection.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, request: ConnectRequest)
        -> BoxFuture<'static, Result<(FrameSink, FrameSource)>>;
}

/// Production connector over `tokio-tungstenite`.
///
/// The token travels both as a `token` query parameter and as an
/// `Authorization: Bearer` header on the upgrade request.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<(FrameSink, FrameSource)>> {
        async move {
            let mut url = Url::parse(&request.url)
                .map_err(|err| LishiError::Client(format!("invalid websocket url: {err}")))?;
            url.query_pairs_mut()
                .append_pair("token", request.token.expose_secret());

            let mut upgrade = url
                .as_str()
                .into_client_request()
                .map_err(|err| LishiError::socket(err.to_string()))?;
            let bearer: HeaderValue = format!("Bearer {}", request.token.expose_secret())
                .parse()
                .map_err(|_| LishiError::credential("access token is not a valid header value"))?;
            upgrade.headers_mut().insert(AUTHORIZATION, bearer);

            let (socket, _) = connect_async(upgrade)
                .await
                .map_err(|err| LishiError::socket(format!("connect failed: {err}")))?;
            let (sink, source) = socket.split();

            let sink = sink.sink_map_err(|err| LishiError::socket(err.to_string()));
            let source = source.map(|item| item.map_err(|err| LishiError::socket(err.to_string())));
            Ok((Box::pin(sink) as FrameSink, Box::pin(source) as FrameSource))
        }
        .boxed()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CloseReason {
    /// `close()` was called or every handle was dropped.
    Requested,
    /// The very first connection attempt failed.
    ConnectFailed(String),
    /// Reconnection attempts ran out.
    Exhausted { attempts: u32, last_error: String },
}

impl CloseReason {
    /// Terminal reasons are delivered to active streams as socket errors.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Requested)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Requested => "connection closed on request".to_string(),
            Self::ConnectFailed(err) => format!("connection failed: {err}"),
            Self::Exhausted {
                attempts,
                last_error,
            } => format!("reconnection abandoned after {attempts} attempts: {last_error}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// Connection is usable. `epoch` increases with every successful open.
    Opened { epoch: u64, reconnected: bool },
    Closed { reason: CloseReason },
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Lifecycle(LifecycleEvent),
    Envelope(InboundEnvelope),
}

/// Ordered stream of lifecycle events and inbound envelopes.
#[derive(Debug)]
pub struct TransportEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportEvents {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    pub backoff: BackoffPolicy,
    /// Bounds the connect and the handshake acknowledgement, each.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end().to_string(),
            backoff: BackoffPolicy::reconnect(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

enum Command {
    Send {
        frame: String,
        ack: oneshot::Sender<Result<u64>>,
    },
    Close,
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

struct TransportInner {
    config: TransportConfig,
    codec: Arc<dyn EnvelopeCodec>,
    connector: Arc<dyn Connector>,
    credentials: CredentialManager,
    state: watch::Sender<ConnectionState>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
    last_failure: Mutex<Option<LishiError>>,
    epoch: Mutex<u64>,
}

impl TransportInner {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    fn publish(&self, event: LifecycleEvent) {
        let _ = self.lifecycle.send(event.clone());
        let _ = self.events.send(TransportEvent::Lifecycle(event));
    }

    fn next_epoch(&self) -> u64 {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        *epoch
    }

    fn finish(&self, reason: CloseReason, failure: Option<LishiError>) {
        debug!(event = "transport_closed", reason = %reason.describe());
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = failure;
        self.publish(LifecycleEvent::Closed { reason });
        self.set_state(ConnectionState::Closed);
    }
}

/// Cloneable handle to the shared connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
    worker: Arc<Mutex<Option<WorkerHandle>>>,
}

impl Transport {
    /// Creates a closed transport. The returned events feed the registry.
    pub fn new(
        config: TransportConfig,
        codec: Arc<dyn EnvelopeCodec>,
        connector: Arc<dyn Connector>,
        credentials: CredentialManager,
    ) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);

        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                codec,
                connector,
                credentials,
                state: state_tx,
                lifecycle: lifecycle_tx,
                events: events_tx,
                last_failure: Mutex::new(None),
                epoch: Mutex::new(0),
            }),
            worker: Arc::new(Mutex::new(None)),
        };
        (transport, TransportEvents { rx: events_rx })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn codec(&self) -> Arc<dyn EnvelopeCodec> {
        Arc::clone(&self.inner.codec)
    }

    /// Watches connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribes to `Opened`/`Closed` notifications for diagnostics.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Ensures the connection is open, connecting if needed.
    ///
    /// Resolves once the transport reports `Open`. While reconnecting this
    /// waits for the next successful connection. Fails with the initial
    /// connect error, or a socket error if the transport ends up closed.
    pub async fn open(&self) -> Result<()> {
        let mut state_rx = self.inner.state.subscribe();
        {
            let mut worker = self.lock_worker();
            match self.state() {
                ConnectionState::Closing => {
                    return Err(LishiError::socket("transport is closing"));
                }
                ConnectionState::Closed => {
                    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                    self.inner.set_state(ConnectionState::Connecting);
                    *worker = Some(WorkerHandle {
                        commands: commands_tx,
                    });
                    tokio::spawn(run_worker(Arc::clone(&self.inner), commands_rx));
                }
                ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::Reconnecting => {}
            }
        }

        let reached = state_rx
            .wait_for(|state| matches!(state, ConnectionState::Open | ConnectionState::Closed))
            .await
            .map(|state| *state);

        match reached {
            Ok(ConnectionState::Open) => Ok(()),
            Ok(_) => Err(self
                .inner
                .last_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_else(|| LishiError::socket("connection closed"))),
            Err(_) => Err(LishiError::socket("transport dropped")),
        }
    }

    /// Writes one frame and returns the epoch of the connection it went out on.
    ///
    /// Fails fast when closed. While connecting or reconnecting it fails with
    /// a retryable socket error; nothing is buffered.
    pub async fn send(&self, frame: String) -> Result<u64> {
        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                return Err(LishiError::transient_socket("connection is not open yet"));
            }
            ConnectionState::Closed | ConnectionState::Closing => {
                return Err(LishiError::socket("connection is closed"));
            }
        }

        let commands = self
            .lock_worker()
            .as_ref()
            .map(|worker| worker.commands.clone())
            .ok_or_else(|| LishiError::socket("connection is closed"))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(Command::Send { frame, ack: ack_tx })
            .map_err(|_| LishiError::socket("send queue is closed"))?;
        ack_rx
            .await
            .map_err(|_| LishiError::transient_socket("connection dropped before the frame was written"))?
    }

    /// Closes the connection. Idempotent and safe from any state.
    pub fn close(&self) {
        let Some(worker) = self.lock_worker().take() else {
            return;
        };

        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closing;
            true
        });
        if worker.commands.send(Command::Close).is_err() {
            self.inner.set_state(ConnectionState::Closed);
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum SessionOutcome {
    GracefulShutdown,
    Reconnect(LishiError),
}

async fn run_worker(inner: Arc<TransportInner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let policy = inner.config.backoff.clone();
    let mut attempt: u32 = 0;
    let mut ever_opened = false;

    loop {
        let outcome = match establish(&inner, &mut commands).await {
            Ok(Some((sink, source))) => {
                let reconnected = ever_opened;
                ever_opened = true;
                attempt = 0;
                let epoch = inner.next_epoch();
                inner.set_state(ConnectionState::Open);
                debug!(event = "transport_opened", epoch, reconnected);
                inner.publish(LifecycleEvent::Opened { epoch, reconnected });
                run_connected_session(&inner, sink, source, epoch, &mut commands).await
            }
            Ok(None) => SessionOutcome::GracefulShutdown,
            Err(err) if !ever_opened => {
                warn!(event = "transport_connect_failed", error = %err);
                inner.finish(CloseReason::ConnectFailed(err.to_string()), Some(err));
                return;
            }
            Err(err) => SessionOutcome::Reconnect(err),
        };

        let reason = match outcome {
            SessionOutcome::GracefulShutdown => {
                inner.finish(CloseReason::Requested, None);
                return;
            }
            SessionOutcome::Reconnect(reason) => reason,
        };

        if !policy.allows_attempt(attempt) {
            warn!(event = "transport_reconnect_exhausted", attempts = attempt, error = %reason);
            let close = CloseReason::Exhausted {
                attempts: attempt,
                last_error: reason.to_string(),
            };
            inner.finish(close, Some(LishiError::socket(reason.to_string())));
            return;
        }

        inner.set_state(ConnectionState::Reconnecting);
        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        debug!(
            event = "transport_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason
        );

        if !reject_sends_during_delay(delay, &mut commands).await {
            inner.finish(CloseReason::Requested, None);
            return;
        }
    }
}

/// Connects with a fresh token and completes the codec handshake.
///
/// `Ok(None)` means a close was requested while connecting.
async fn establish(
    inner: &TransportInner,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<Option<(FrameSink, FrameSource)>> {
    let attempt = async {
        let token = inner.credentials.get_token().await?;
        let request = ConnectRequest {
            url: inner.config.url.clone(),
            token: token.secret().clone(),
        };

        let (mut sink, mut source) =
            with_timeout(inner.config.connect_timeout, inner.connector.connect(request))
                .await
                .map_err(|_| LishiError::socket("connect timed out"))??;

        if let Some(init) = inner.codec.connection_init(&token) {
            sink.send(Message::Text(init)).await?;
            with_timeout(
                inner.config.connect_timeout,
                await_connection_ack(inner.codec.as_ref(), &mut sink, &mut source),
            )
            .await
            .map_err(|_| LishiError::socket("timed out waiting for connection_ack"))??;
        }

        Ok::<_, LishiError>((sink, source))
    };
    tokio::pin!(attempt);

    loop {
        tokio::select! {
            result = &mut attempt => return result.map(Some),
            command = commands.recv() => match command {
                Some(Command::Send { ack, .. }) => {
                    let _ = ack.send(Err(LishiError::transient_socket("connection is not open yet")));
                }
                Some(Command::Close) | None => return Ok(None),
            }
        }
    }
}

async fn await_connection_ack(
    codec: &dyn EnvelopeCodec,
    sink: &mut FrameSink,
    source: &mut FrameSource,
) -> Result<()> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match codec.decode(&text)?.kind {
                EnvelopeKind::ControlOther(ControlFrame::ConnectionAck) => return Ok(()),
                EnvelopeKind::ControlOther(ControlFrame::ConnectionError(payload)) => {
                    return Err(LishiError::socket(format!("connection rejected: {payload}")));
                }
                _ => {}
            },
            Some(Ok(Message::Ping(payload))) => {
                sink.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Close(_))) => {
                return Err(LishiError::socket("socket closed before connection_ack"));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err),
            None => return Err(LishiError::socket("socket ended before connection_ack")),
        }
    }
}

async fn run_connected_session(
    inner: &TransportInner,
    mut sink: FrameSink,
    mut source: FrameSource,
    epoch: u64,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionOutcome {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { frame, ack }) => {
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        let _ = ack.send(Err(LishiError::transient_socket(err.to_string())));
                        return SessionOutcome::Reconnect(err);
                    }
                    let _ = ack.send(Ok(epoch));
                }
                Some(Command::Close) | None => {
                    if let Some(terminate) = inner.codec.connection_terminate() {
                        let _ = sink.send(Message::Text(terminate)).await;
                    }
                    let _ = sink.close().await;
                    return SessionOutcome::GracefulShutdown;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match inner.codec.decode(&text) {
                    Ok(envelope) => {
                        if let EnvelopeKind::ControlOther(control) = &envelope.kind {
                            if let ControlFrame::ConnectionError(payload) = control {
                                return SessionOutcome::Reconnect(LishiError::socket(format!(
                                    "connection error: {payload}"
                                )));
                            }
                            trace!(event = "transport_control_frame", tag = %envelope.tag);
                            continue;
                        }
                        let _ = inner.events.send(TransportEvent::Envelope(envelope));
                    }
                    Err(err) => warn!(event = "transport_frame_undecodable", error = %err),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        return SessionOutcome::Reconnect(err);
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return SessionOutcome::Reconnect(LishiError::socket("server closed the connection"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionOutcome::Reconnect(err),
                None => return SessionOutcome::Reconnect(LishiError::socket("connection ended")),
            }
        }
    }
}

/// Sleeps out the backoff delay, rejecting sends with a retryable error.
///
/// Returns `false` when a close was requested.
async fn reject_sends_during_delay(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(Command::Send { ack, .. }) => {
                    let _ = ack.send(Err(LishiError::transient_socket("connection is reconnecting")));
                }
                Some(Command::Close) | None => return false,
            }
        }
    }
}
