//! Stateless request/response transport.
//!
//! [`RequestTransport`] is the capability the credential manager and the
//! GraphQL query path depend on. [`ReqwestTransport`] is the production
//! implementation; [`ApiClient`] layers bearer-token authorization on top.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::CredentialManager;
use crate::error::{ApiErrorData, LishiError, Result};
use crate::retry::{retry_async, BackoffPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpDefaults;

impl HttpDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: BackoffPolicy,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HttpDefaults::CONNECT_TIMEOUT,
            attempt_timeout: HttpDefaults::ATTEMPT_TIMEOUT,
            retry_policy: BackoffPolicy::requests(),
        }
    }
}

/// A single API call, relative to the transport's base URL.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub path: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Whether a timed-out or 5xx attempt may be sent again. Defaults to the
    /// method's semantics; other requests only retry connect failures and 429.
    pub idempotent: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            idempotent: method.is_idempotent(),
            method,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(header, _)| header.eq_ignore_ascii_case(name))
    }
}

/// Stateless request collaborator.
///
/// Implementations must keep network failures ([`LishiError::Http`]) apart
/// from structured ([`LishiError::Api`]) and non-conforming
/// ([`LishiError::GenericApi`]) error bodies.
pub trait RequestTransport: Send + Sync + 'static {
    fn request(&self, request: ApiRequest) -> BoxFuture<'_, Result<Value>>;
}

/// [`RequestTransport`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: BackoffPolicy,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, options: HttpOptions) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| LishiError::Http {
                message: err.to_string(),
                retryable: false,
            })?;

        Ok(Self::with_client(http, base_url, options))
    }

    /// Reuses an existing `reqwest` client, e.g. to share its pool.
    pub fn with_client(http: Client, base_url: impl Into<String>, options: HttpOptions) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn send_attempt(&self, request: &ApiRequest) -> Result<Value> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.endpoint(&request.path))
            .timeout(self.attempt_timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let idempotent = request.idempotent;
        let response = builder
            .send()
            .await
            .map_err(|err| transport_error(err, idempotent))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_error(err, idempotent))?;

        if !status.is_success() {
            return Err(parse_error_response(status, &body));
        }

        parse_success_body(&body)
    }
}

impl RequestTransport for ReqwestTransport {
    fn request(&self, request: ApiRequest) -> BoxFuture<'_, Result<Value>> {
        async move {
            retry_async(
                &self.retry_policy,
                |_| self.send_attempt(&request),
                |err| should_retry(&request, err),
            )
            .await
        }
        .boxed()
    }
}

/// Authorized API access: every call carries the current bearer token.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn RequestTransport>,
    credentials: CredentialManager,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn RequestTransport>, credentials: CredentialManager) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Performs `request` with `Authorization: Bearer <token>` and decodes
    /// the body into `T`. Caller-supplied headers win over the default one.
    pub async fn api_request<T>(&self, mut request: ApiRequest) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if !request.has_header("authorization") {
            let token = self.credentials.get_token().await?;
            request.headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", token.secret().expose_secret()),
            ));
        }

        let body = self.transport.request(request).await?;
        serde_json::from_value(body).map_err(LishiError::from)
    }
}

/// A timeout may fire after the server acted, so only idempotent requests
/// treat it as retryable.
fn transport_error(err: reqwest::Error, idempotent: bool) -> LishiError {
    LishiError::Http {
        retryable: err.is_connect() || (idempotent && err.is_timeout()),
        message: err.to_string(),
    }
}

fn should_retry(request: &ApiRequest, err: &LishiError) -> bool {
    if request.idempotent {
        return err.is_retryable();
    }
    match err {
        LishiError::Http { retryable, .. } => *retryable,
        LishiError::GenericApi { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS.as_u16(),
        _ => false,
    }
}

fn parse_success_body(body: &str) -> Result<Value> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body).map_err(LishiError::from)
}

/// Maps a non-2xx response onto [`LishiError::Api`] when the body follows
/// the service error format, [`LishiError::GenericApi`] otherwise.
pub(crate) fn parse_error_response(status: StatusCode, body: &str) -> LishiError {
    let data = serde_json::from_str::<Value>(body).ok();

    if let Some(value) = data.as_ref() {
        if let Ok(api_error) = serde_json::from_value::<ApiErrorData>(value.clone()) {
            return LishiError::Api(api_error);
        }
    }

    let snippet: String = body.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
    LishiError::generic_api(status.as_u16(), snippet, data)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        parse_error_response, parse_success_body, should_retry, ApiRequest, HttpOptions,
        ReqwestTransport,
    };
    use crate::error::LishiError;

    #[test]
    fn structured_error_body_maps_to_api_error() {
        let body = r#"{"code":"auth_invalid_api_key_error","message":"invalid key","trace_id":"abc","details":{"key":"xyz"}}"#;
        match parse_error_response(StatusCode::UNAUTHORIZED, body) {
            LishiError::Api(data) => {
                assert_eq!(data.code, "auth_invalid_api_key_error");
                assert_eq!(data.message, "invalid key");
                assert_eq!(data.trace_id.as_deref(), Some("abc"));
                assert_eq!(
                    data.details.and_then(|details| details.get("key").cloned()),
                    Some(json!("xyz"))
                );
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn non_conforming_json_body_maps_to_generic_error() {
        let body = r#"{"error":{"what":"chain failure"},"message":"Internal Service Error"}"#;
        match parse_error_response(StatusCode::INTERNAL_SERVER_ERROR, body) {
            LishiError::GenericApi {
                status,
                data,
                message,
                ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(message, "Internal Service Error");
                assert!(data.is_some());
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn plain_text_body_maps_to_generic_error_without_data() {
        let body = "x".repeat(500);
        match parse_error_response(StatusCode::BAD_GATEWAY, &body) {
            LishiError::GenericApi {
                status, data, body, ..
            } => {
                assert_eq!(status, 502);
                assert!(data.is_none());
                assert_eq!(body.len(), 220);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn empty_success_body_decodes_as_null() {
        assert_eq!(parse_success_body("  ").expect("parse"), serde_json::Value::Null);
        assert_eq!(
            parse_success_body(r#"{"ok":true}"#).expect("parse"),
            json!({"ok": true})
        );
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let transport =
            ReqwestTransport::new("https://api.example.com/", HttpOptions::default()).expect("build");
        assert_eq!(transport.base_url(), "https://api.example.com");
        assert_eq!(
            transport.endpoint("/v1/auth/issue"),
            "https://api.example.com/v1/auth/issue"
        );
        assert_eq!(transport.endpoint("graphql"), "https://api.example.com/graphql");
        assert_eq!(transport.endpoint(""), "https://api.example.com");
    }

    #[test]
    fn non_idempotent_requests_only_retry_when_nothing_was_sent() {
        let mutation = ApiRequest::post("");
        assert!(!mutation.idempotent);
        assert!(ApiRequest::get("/v1/head").idempotent);
        assert!(ApiRequest::post("").with_idempotent(true).idempotent);

        let refused = LishiError::Http {
            message: "connection refused".to_string(),
            retryable: true,
        };
        let throttled = LishiError::generic_api(429, "slow down", None);
        let failed = LishiError::generic_api(503, "unavailable", None);
        assert!(should_retry(&mutation, &refused));
        assert!(should_retry(&mutation, &throttled));
        assert!(!should_retry(&mutation, &failed));
        assert!(should_retry(&ApiRequest::get("/v1/head"), &failed));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = ApiRequest::get("/v0/state").with_header("authorization", "Bearer x");
        assert!(request.has_header("Authorization"));
        assert!(!request.has_header("x-api-key"));
    }
}
