//! Top-level client wiring credentials, HTTP and both stream flavors.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::auth::{
    AccessToken, ApiKeyIssuer, AuthTokenResponse, CredentialManager, TokenStore,
    DEFAULT_REFRESH_MARGIN,
};
use crate::error::Result;
use crate::graphql::{GraphqlClient, GraphqlResponse, GraphqlStreamMessage, SubscribeOptions};
use crate::http::{ApiClient, ApiRequest, HttpOptions, ReqwestTransport};
use crate::retry::BackoffPolicy;
use crate::stream::codec::{EnvelopeCodec, GraphqlCodec, PushCodec, RegistrationSpec};
use crate::stream::push::{
    ActionTracesRequest, InboundMessage, PushStreamClient, StreamOptions, TableRowsRequest,
    TransactionLifecycleRequest,
};
use crate::stream::registry::{RegistryConfig, Stream, StreamRegistry};
use crate::stream::transport::{
    Connector, LifecycleEvent, Transport, TransportConfig, WebSocketConnector,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const AUTH_URL: &'static str = "https://lishi.zhongshuwen.com";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REFRESH_MARGIN: Duration = DEFAULT_REFRESH_MARGIN;
}

/// Service URLs used by the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoints {
    pub auth_url: String,
    pub rest_url: String,
    pub graphql_query_url: String,
    pub graphql_stream_url: String,
    pub websocket_url: String,
}

impl Endpoints {
    /// Derives every endpoint from a network host such as `testnet.example.com`.
    pub fn for_network(network: &str, secure: bool) -> Self {
        let host = network
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        let (http, ws) = if secure { ("https", "wss") } else { ("http", "ws") };

        Self {
            auth_url: ClientDefaults::AUTH_URL.to_string(),
            rest_url: format!("{http}://{host}"),
            graphql_query_url: format!("{http}://{host}/graphql"),
            graphql_stream_url: format!("{ws}://{host}/graphql"),
            websocket_url: format!("{ws}://{host}/v1/stream"),
        }
    }

    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self
    }
}

#[derive(Clone)]
pub struct ClientOptions {
    pub api_key: Option<SecretString>,
    pub endpoints: Endpoints,
    pub refresh_margin: Duration,
    pub token_store: Option<Arc<dyn TokenStore>>,
    pub http: HttpOptions,
    pub reconnect_backoff: BackoffPolicy,
    pub connect_timeout: Duration,
    pub restart_on_terminal_error: bool,
    pub restart_backoff: BackoffPolicy,
    pub connector: Arc<dyn Connector>,
}

impl ClientOptions {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            api_key: None,
            endpoints,
            refresh_margin: ClientDefaults::REFRESH_MARGIN,
            token_store: None,
            http: HttpOptions::default(),
            reconnect_backoff: BackoffPolicy::reconnect(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            restart_on_terminal_error: false,
            restart_backoff: BackoffPolicy::reconnect(),
            connector: Arc::new(WebSocketConnector),
        }
    }

    pub fn for_network(network: &str) -> Self {
        Self::new(Endpoints::for_network(network, true))
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn with_http_options(mut self, http: HttpOptions) -> Self {
        self.http = http;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_restart_on_terminal_error(mut self, enabled: bool) -> Self {
        self.restart_on_terminal_error = enabled;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    fn registry(
        &self,
        url: &str,
        codec: Arc<dyn EnvelopeCodec>,
        credentials: &CredentialManager,
    ) -> StreamRegistry {
        let config = TransportConfig::new(url)
            .with_backoff(self.reconnect_backoff.clone())
            .with_connect_timeout(self.connect_timeout);
        let (transport, events) = Transport::new(
            config,
            codec,
            Arc::clone(&self.connector),
            credentials.clone(),
        );
        let registry_config = RegistryConfig::default()
            .with_restart_on_terminal_error(self.restart_on_terminal_error)
            .with_restart_backoff(self.restart_backoff.clone());
        StreamRegistry::new(transport, events, registry_config)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoints", &self.endpoints)
            .field("refresh_margin", &self.refresh_margin)
            .field("http", &self.http)
            .field("reconnect_backoff", &self.reconnect_backoff)
            .field("connect_timeout", &self.connect_timeout)
            .field("restart_on_terminal_error", &self.restart_on_terminal_error)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    endpoints: Endpoints,
    credentials: CredentialManager,
    issuer: ApiKeyIssuer,
    api: ApiClient,
    push: PushStreamClient,
    graphql: GraphqlClient,
    released: AtomicBool,
}

/// Entry point of the SDK. Cheap to clone.
///
/// Must be created inside a tokio runtime: each stream flavor spawns a
/// dispatch task up front.
#[derive(Clone)]
pub struct LishiClient {
    inner: Arc<ClientInner>,
}

impl LishiClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let endpoints = options.endpoints.clone();

        let auth_http = Arc::new(ReqwestTransport::new(&endpoints.auth_url, options.http.clone())?);
        let issuer = ApiKeyIssuer::new(options.api_key.clone(), auth_http);

        let mut credentials = CredentialManager::builder(Arc::new(issuer.clone()))
            .with_refresh_margin(options.refresh_margin);
        if let Some(store) = options.token_store.as_ref() {
            credentials = credentials.with_store(Arc::clone(store));
        }
        let credentials = credentials.build();

        let rest_http = Arc::new(ReqwestTransport::new(&endpoints.rest_url, options.http.clone())?);
        let graphql_http = Arc::new(ReqwestTransport::new(
            &endpoints.graphql_query_url,
            options.http.clone(),
        )?);

        let push = PushStreamClient::new(options.registry(
            &endpoints.websocket_url,
            Arc::new(PushCodec),
            &credentials,
        ));
        let graphql = GraphqlClient::new(
            ApiClient::new(graphql_http, credentials.clone()),
            options.registry(
                &endpoints.graphql_stream_url,
                Arc::new(GraphqlCodec),
                &credentials,
            ),
        );

        debug!(event = "client_created", rest_url = %endpoints.rest_url);
        Ok(Self {
            inner: Arc::new(ClientInner {
                api: ApiClient::new(rest_http, credentials.clone()),
                endpoints,
                credentials,
                issuer,
                push,
                graphql,
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    pub async fn get_token(&self) -> Result<AccessToken> {
        self.inner.credentials.get_token().await
    }

    pub async fn set_token(&self, token: AccessToken) -> Result<()> {
        self.inner.credentials.set_token(token).await
    }

    /// `POST /v1/auth/issue` on the auth endpoint. Does not touch the cache.
    pub async fn auth_issue(&self, api_key: Option<SecretString>) -> Result<AuthTokenResponse> {
        self.inner.issuer.auth_issue(api_key).await
    }

    /// Authorized call against the REST endpoint.
    pub async fn api_request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.inner.api.api_request(request).await
    }

    pub async fn graphql_query<T: DeserializeOwned>(
        &self,
        document: &str,
        variables: Option<Value>,
    ) -> Result<GraphqlResponse<T>> {
        self.inner.graphql.query(document, variables).await
    }

    pub async fn graphql_subscribe<F>(
        &self,
        document: &str,
        variables: Option<Value>,
        on_message: F,
        options: SubscribeOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &GraphqlStreamMessage) + Send + Sync + 'static,
    {
        self.inner
            .graphql
            .subscribe(document, variables, on_message, options)
            .await
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
        self.inner
            .push
            .stream_action_traces(request, on_message, options)
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
        self.inner
            .push
            .stream_table_rows(request, on_message, options)
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
        self.inner
            .push
            .stream_transaction(request, on_message, options)
            .await
    }

    pub async fn stream_head_info<F>(&self, on_message: F, options: StreamOptions) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        self.inner.push.stream_head_info(on_message, options).await
    }

    pub async fn websocket_stream<F>(
        &self,
        spec: RegistrationSpec,
        on_message: F,
        options: StreamOptions,
    ) -> Result<Stream>
    where
        F: Fn(&Stream, &InboundMessage) + Send + Sync + 'static,
    {
        self.inner
            .push
            .websocket_stream(spec, on_message, options)
            .await
    }

    pub fn push(&self) -> &PushStreamClient {
        &self.inner.push
    }

    pub fn graphql(&self) -> &GraphqlClient {
        &self.inner.graphql
    }

    pub fn push_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.push.registry().transport().lifecycle()
    }

    pub fn graphql_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.graphql.registry().transport().lifecycle()
    }

    /// Closes every stream and connection and drops the cached token.
    ///
    /// Idempotent. Pending joins resolve `Ok`.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.push.registry().release();
        self.inner.graphql.registry().release();
        self.inner.credentials.release();
        debug!(event = "client_released");
    }
}
