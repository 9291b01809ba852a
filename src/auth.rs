//! API token lifecycle.
//!
//! [`CredentialManager`] owns the access token used to authorize the
//! websocket transports and the HTTP API. It refreshes the token shortly
//! before expiry and coalesces concurrent refreshes so that N callers racing
//! on an empty cache trigger exactly one issuance request.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{LishiError, Result};
use crate::http::{ApiRequest, RequestTransport};

/// Default remaining lifetime under which a cached token is refreshed.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(120);
const AUTH_ISSUE_PATH: &str = "/v1/auth/issue";

/// Issued API access token.
#[derive(Clone)]
pub struct AccessToken {
    value: SecretString,
    expires_at: SystemTime,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            value: SecretString::new(value.into()),
            expires_at,
        }
    }

    /// Builds a token from a unix timestamp in seconds.
    pub fn from_unix(value: impl Into<String>, expires_at_secs: u64) -> Self {
        Self::new(value, UNIX_EPOCH + Duration::from_secs(expires_at_secs))
    }

    pub fn secret(&self) -> &SecretString {
        &self.value
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn expires_at_unix(&self) -> u64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    /// True when the token expires within `margin` of `now`.
    pub fn is_expiring(&self, now: SystemTime, margin: Duration) -> bool {
        now.checked_add(margin)
            .map_or(true, |deadline| deadline >= self.expires_at)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at_unix())
            .finish()
    }
}

/// Response body of `POST /v1/auth/issue`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthTokenResponse {
    pub token: String,
    /// Unix timestamp in seconds.
    pub expires_at: u64,
}

impl From<AuthTokenResponse> for AccessToken {
    fn from(response: AuthTokenResponse) -> Self {
        AccessToken::from_unix(response.token, response.expires_at)
    }
}

/// Wall-clock source used for expiry checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Produces fresh access tokens.
pub trait TokenIssuer: Send + Sync + 'static {
    fn issue(&self) -> BoxFuture<'static, Result<AccessToken>>;
}

/// Issues tokens by exchanging an API key on the auth endpoint.
#[derive(Clone)]
pub struct ApiKeyIssuer {
    api_key: Option<SecretString>,
    transport: Arc<dyn RequestTransport>,
}

impl ApiKeyIssuer {
    pub fn new(api_key: Option<SecretString>, transport: Arc<dyn RequestTransport>) -> Self {
        Self { api_key, transport }
    }

    /// Issues a token for `api_key`, or the configured key when `None`.
    pub async fn auth_issue(&self, api_key: Option<SecretString>) -> Result<AuthTokenResponse> {
        let api_key = api_key.or_else(|| self.api_key.clone()).ok_or_else(|| {
            LishiError::credential("no api key configured; provide one or call set_token")
        })?;

        // Issuing twice only mints a spare token.
        let request = ApiRequest::post(AUTH_ISSUE_PATH)
            .with_idempotent(true)
            .with_body(json!({ "api_key": api_key.expose_secret() }));
        let body = self.transport.request(request).await?;
        serde_json::from_value(body).map_err(LishiError::from)
    }
}

impl TokenIssuer for ApiKeyIssuer {
    fn issue(&self) -> BoxFuture<'static, Result<AccessToken>> {
        let issuer = self.clone();
        async move { Ok(issuer.auth_issue(None).await?.into()) }.boxed()
    }
}

/// Token persistence backend.
pub trait TokenStore: Send + Sync + 'static {
    fn load(&self) -> BoxFuture<'static, Result<Option<AccessToken>>>;
    fn save(&self, token: &AccessToken) -> BoxFuture<'static, Result<()>>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryTokenStore {
    token: Arc<Mutex<Option<AccessToken>>>,
}

impl TokenStore for InMemoryTokenStore {
    fn load(&self) -> BoxFuture<'static, Result<Option<AccessToken>>> {
        let token = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        async move { Ok(token) }.boxed()
    }

    fn save(&self, token: &AccessToken) -> BoxFuture<'static, Result<()>> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        async { Ok(()) }.boxed()
    }
}

/// Persists the token as JSON (`{"token": ..., "expires_at": ...}`).
#[derive(Clone, Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> BoxFuture<'static, Result<Option<AccessToken>>> {
        let path = self.path.clone();
        async move {
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(LishiError::credential(format!(
                        "read token file {}: {err}",
                        path.display()
                    )))
                }
            };
            let stored: AuthTokenResponse = serde_json::from_str(&raw)?;
            Ok(Some(stored.into()))
        }
        .boxed()
    }

    fn save(&self, token: &AccessToken) -> BoxFuture<'static, Result<()>> {
        let path = self.path.clone();
        let stored = AuthTokenResponse {
            token: token.secret().expose_secret().clone(),
            expires_at: token.expires_at_unix(),
        };
        async move {
            let raw = serde_json::to_string(&stored)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    LishiError::credential(format!("create {}: {err}", parent.display()))
                })?;
            }
            tokio::fs::write(&path, raw).await.map_err(|err| {
                LishiError::credential(format!("write token file {}: {err}", path.display()))
            })
        }
        .boxed()
    }
}

type PendingToken = Shared<BoxFuture<'static, Result<AccessToken>>>;

#[derive(Default)]
struct CredentialState {
    token: Option<AccessToken>,
    generation: u64,
    in_flight: Option<PendingToken>,
}

struct CredentialInner {
    issuer: Arc<dyn TokenIssuer>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
    state: Mutex<CredentialState>,
}

impl CredentialInner {
    fn lock_state(&self) -> MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_usable(&self, token: &AccessToken) -> bool {
        !token.is_expiring(self.clock.now(), self.refresh_margin)
    }
}

/// Owns the cached access token and its refresh.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<CredentialInner>,
}

impl CredentialManager {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self::builder(issuer).build()
    }

    pub fn builder(issuer: Arc<dyn TokenIssuer>) -> CredentialManagerBuilder {
        CredentialManagerBuilder {
            issuer,
            store: Arc::new(InMemoryTokenStore::default()),
            clock: Arc::new(SystemClock),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Returns a token that is not within the refresh margin of expiry.
    ///
    /// Concurrent callers share one in-flight refresh. On failure every
    /// waiter receives the same [`LishiError::Credential`] and the cache is
    /// left untouched.
    pub async fn get_token(&self) -> Result<AccessToken> {
        let pending = {
            let mut state = self.inner.lock_state();
            if let Some(token) = state.token.as_ref() {
                if self.inner.is_usable(token) {
                    return Ok(token.clone());
                }
            }

            match state.in_flight.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = refresh(Arc::clone(&self.inner), state.generation)
                        .boxed()
                        .shared();
                    state.in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Replaces the cached token, e.g. after an explicit issuance.
    pub async fn set_token(&self, token: AccessToken) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            state.token = Some(token.clone());
            state.generation += 1;
        }
        self.inner.store.save(&token).await
    }

    /// Currently cached token, without triggering a refresh.
    pub fn cached_token(&self) -> Option<AccessToken> {
        self.inner.lock_state().token.clone()
    }

    /// Drops the cached token and forgets any in-flight refresh.
    ///
    /// The token store is left as is, so a persisted token outlives the
    /// manager and the next `get_token` may load it again instead of issuing.
    pub fn release(&self) {
        let mut state = self.inner.lock_state();
        state.token = None;
        state.in_flight = None;
        state.generation += 1;
    }
}

pub struct CredentialManagerBuilder {
    issuer: Arc<dyn TokenIssuer>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
}

impl CredentialManagerBuilder {
    pub fn with_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn build(self) -> CredentialManager {
        CredentialManager {
            inner: Arc::new(CredentialInner {
                issuer: self.issuer,
                store: self.store,
                clock: self.clock,
                refresh_margin: self.refresh_margin,
                state: Mutex::new(CredentialState::default()),
            }),
        }
    }
}

async fn refresh(inner: Arc<CredentialInner>, generation: u64) -> Result<AccessToken> {
    let result = load_or_issue(&inner).await;

    let mut state = inner.lock_state();
    if state.generation == generation {
        state.in_flight = None;
    }
    let token = result?;

    if state.generation != generation {
        // Overridden or released while refreshing: never clobber the cache.
        if let Some(current) = state.token.as_ref().filter(|t| inner.is_usable(t)) {
            return Ok(current.clone());
        }
        return Ok(token);
    }
    state.token = Some(token.clone());
    Ok(token)
}

async fn load_or_issue(inner: &CredentialInner) -> Result<AccessToken> {
    match inner.store.load().await {
        Ok(Some(stored)) if inner.is_usable(&stored) => {
            debug!(event = "token_loaded_from_store", expires_at = stored.expires_at_unix());
            return Ok(stored);
        }
        Ok(_) => {}
        Err(err) => warn!(event = "token_store_load_failed", error = %err),
    }

    let token = inner.issuer.issue().await.map_err(|err| match err {
        LishiError::Credential { .. } => err,
        other => LishiError::credential(format!("token issuance failed: {other}")),
    })?;

    if token.is_expired(inner.clock.now()) {
        return Err(LishiError::credential("issued token is already expired"));
    }
    debug!(event = "token_issued", expires_at = token.expires_at_unix());

    if let Err(err) = inner.store.save(&token).await {
        warn!(event = "token_store_save_failed", error = %err);
    }
    Ok(token)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    use futures_util::future::{join_all, BoxFuture};
    use futures_util::FutureExt;
    use secrecy::ExposeSecret;

    use super::{
        AccessToken, Clock, CredentialManager, FileTokenStore, InMemoryTokenStore, TokenIssuer,
        TokenStore,
    };
    use crate::error::{LishiError, Result};

    /// Issues `token-<n>` valid for an hour; counts issuance calls.
    #[derive(Default)]
    pub(crate) struct CountingIssuer {
        pub(crate) calls: AtomicUsize,
        pub(crate) fail: bool,
        pub(crate) delay: Duration,
    }

    impl CountingIssuer {
        pub(crate) fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    impl TokenIssuer for CountingIssuer {
        fn issue(&self) -> BoxFuture<'static, Result<AccessToken>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = self.fail;
            let delay = self.delay;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    return Err(LishiError::Http {
                        message: "connection refused".to_string(),
                        retryable: true,
                    });
                }
                Ok(AccessToken::new(
                    format!("token-{call}"),
                    SystemTime::now() + Duration::from_secs(3600),
                ))
            }
            .boxed()
        }
    }

    /// Store that never has a token.
    struct EmptyStore;

    impl TokenStore for EmptyStore {
        fn load(&self) -> BoxFuture<'static, Result<Option<AccessToken>>> {
            async { Ok(None) }.boxed()
        }

        fn save(&self, _token: &AccessToken) -> BoxFuture<'static, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    struct ManualClock(Mutex<SystemTime>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().expect("clock");
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().expect("clock")
        }
    }

    fn value(token: &AccessToken) -> String {
        token.secret().expose_secret().clone()
    }

    #[tokio::test]
    async fn concurrent_callers_share_a_single_issuance() {
        let issuer = Arc::new(CountingIssuer {
            delay: Duration::from_millis(20),
            ..CountingIssuer::default()
        });
        let manager = CredentialManager::new(issuer.clone());

        let tokens = join_all((0..8).map(|_| manager.get_token())).await;

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        for token in tokens {
            assert_eq!(value(&token.expect("token")), "token-1");
        }
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_refresh_margin() {
        let clock = Arc::new(ManualClock(Mutex::new(SystemTime::now())));
        let issuer = CountingIssuer::shared();
        let manager = CredentialManager::builder(issuer.clone())
            .with_clock(clock.clone())
            .with_refresh_margin(Duration::from_secs(300))
            .build();

        assert_eq!(value(&manager.get_token().await.expect("first")), "token-1");
        clock.advance(Duration::from_secs(3000));
        assert_eq!(value(&manager.get_token().await.expect("cached")), "token-1");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

        // 3600s lifetime, 300s margin: 3301s in is inside the margin.
        clock.advance(Duration::from_secs(301));
        assert_eq!(value(&manager.get_token().await.expect("refreshed")), "token-2");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn issuance_failure_rejects_all_waiters_and_keeps_cache() {
        let issuer = Arc::new(CountingIssuer {
            fail: true,
            delay: Duration::from_millis(10),
            ..CountingIssuer::default()
        });
        let manager = CredentialManager::new(issuer.clone());
        let stale = AccessToken::new("stale", SystemTime::now() + Duration::from_secs(5));
        manager.set_token(stale).await.expect("set");

        let results = join_all((0..4).map(|_| manager.get_token())).await;

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(matches!(result, Err(LishiError::Credential { .. })));
        }
        let cached = manager.cached_token().expect("stale token kept");
        assert_eq!(value(&cached), "stale");

        // The failed attempt is not sticky: the next call issues again.
        assert!(manager.get_token().await.is_err());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn set_token_overrides_cache() {
        let issuer = CountingIssuer::shared();
        let manager = CredentialManager::new(issuer.clone());
        manager
            .set_token(AccessToken::new(
                "external",
                SystemTime::now() + Duration::from_secs(3600),
            ))
            .await
            .expect("set");

        assert_eq!(value(&manager.get_token().await.expect("token")), "external");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn usable_stored_token_skips_issuance() {
        let store = Arc::new(InMemoryTokenStore::default());
        store
            .save(&AccessToken::new(
                "persisted",
                SystemTime::now() + Duration::from_secs(3600),
            ))
            .await
            .expect("save");
        let issuer = CountingIssuer::shared();
        let manager = CredentialManager::builder(issuer.clone())
            .with_store(store)
            .build();

        assert_eq!(value(&manager.get_token().await.expect("token")), "persisted");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn file_store_persists_issued_token() {
        let path = std::env::temp_dir()
            .join(format!("lishi-sdk-{}", uuid::Uuid::new_v4().simple()))
            .join("token.json");
        let store = Arc::new(FileTokenStore::new(path.clone()));
        assert!(store.load().await.expect("load missing").is_none());

        let manager = CredentialManager::builder(CountingIssuer::shared())
            .with_store(store.clone())
            .build();
        let issued = manager.get_token().await.expect("token");

        let loaded = store.load().await.expect("load").expect("stored token");
        assert_eq!(value(&loaded), value(&issued));
        assert_eq!(loaded.expires_at_unix(), issued.expires_at_unix());

        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_finishing_after_release_does_not_unblock_a_second_refresh() {
        let issuer = Arc::new(CountingIssuer {
            delay: Duration::from_millis(100),
            ..CountingIssuer::default()
        });
        let manager = CredentialManager::builder(issuer.clone())
            .with_store(Arc::new(EmptyStore))
            .build();

        let before_release = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_token().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.release();

        let after_release = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_token().await }
        });
        // The pre-release refresh completes at 100ms, the newer one at 110ms.
        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(value(&before_release.await.expect("task").expect("token")), "token-1");
        assert!(manager.cached_token().is_none());

        let joined = manager.get_token().await.expect("token");
        assert_eq!(value(&joined), "token-2");
        assert_eq!(value(&after_release.await.expect("task").expect("token")), "token-2");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn release_keeps_the_persisted_token() {
        let store = Arc::new(InMemoryTokenStore::default());
        let issuer = CountingIssuer::shared();
        let manager = CredentialManager::builder(issuer.clone())
            .with_store(store)
            .build();
        let issued = manager.get_token().await.expect("token");

        manager.release();
        assert!(manager.cached_token().is_none());

        let reloaded = manager.get_token().await.expect("token");
        assert_eq!(value(&reloaded), value(&issued));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiring_checks_margin() {
        let now = SystemTime::now();
        let token = AccessToken::new("t", now + Duration::from_secs(60));
        assert!(!token.is_expired(now));
        assert!(token.is_expiring(now, Duration::from_secs(60)));
        assert!(!token.is_expiring(now, Duration::from_secs(59)));
        assert!(token.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn debug_output_redacts_value() {
        let token = AccessToken::from_unix("super-secret", 1_700_000_000);
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("1700000000"));
    }
}
