//! OAuth access-token lifecycle: one-time consent, durable refresh token, on-demand refresh
//! and a single retry when the provider rejects a request with 401.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use smc_core::{AuthError, RefreshTokenRecord, Token, TOKEN_EXPIRY_BUFFER_SECS};
use smc_fetch::FetchError;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smc-auth";

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const SEARCH_CONSOLE_SCOPE: &str = "https://www.googleapis.com/auth/webmasters.readonly";

/// JSON file holding the refresh token issued by the out-of-band consent step.
#[derive(Debug, Clone)]
pub struct RefreshTokenStore {
    path: PathBuf,
}

impl RefreshTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when the file is absent or carries an empty token.
    pub async fn load(&self) -> anyhow::Result<Option<RefreshTokenRecord>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading refresh token {}", self.path.display()))
            }
        };
        let record: RefreshTokenRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing refresh token {}", self.path.display()))?;
        if record.refresh_token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn exists(&self) -> bool {
        matches!(self.load().await, Ok(Some(_)))
    }

    /// Writes the record through a temp file and rename so readers never see a partial file.
    pub async fn save(&self, refresh_token: &str) -> anyhow::Result<RefreshTokenRecord> {
        let record = RefreshTokenRecord {
            refresh_token: refresh_token.trim().to_string(),
            created_at: Utc::now(),
        };
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating token directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(&record).context("serializing refresh token")?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp token file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp token file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp token file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp token file {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        info!(path = %self.path.display(), "refresh token stored");
        Ok(record)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

/// Response to an authorization-code exchange. Only a consent with `access_type=offline`
/// carries a refresh token.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeGrant {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

#[derive(Debug)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

/// Refresh-token grant against a standard OAuth2 token endpoint.
#[derive(Debug)]
pub struct OAuthTokenEndpoint {
    client: reqwest::Client,
    config: OAuthClientConfig,
}

impl OAuthTokenEndpoint {
    pub fn new(client: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self { client, config }
    }

    /// Consent page that hands a code to `redirect_uri`. Offline access plus a forced consent
    /// prompt make the provider issue a refresh token even for an app the user already approved.
    pub fn consent_url(
        &self,
        auth_url: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<Url, AuthError> {
        let scope = scopes.join(" ");
        Url::parse_with_params(
            auth_url,
            [
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| AuthError::Unknown(format!("bad authorization url {auth_url:?}: {e}")))
    }

    #[instrument(skip_all, fields(token_url = %self.config.token_url))]
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<CodeGrant, AuthError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];
        self.post_form(&params).await
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, AuthError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::Unknown(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "token endpoint returned an error");
            return Err(classify_token_error(status.as_u16(), &body));
        }

        resp.json::<T>()
            .await
            .map_err(|e| AuthError::Unknown(format!("unreadable token response: {e}")))
    }
}

/// Finishes the consent flow: trades the callback `code` for tokens and persists the refresh token.
pub async fn complete_consent(
    endpoint: &OAuthTokenEndpoint,
    store: &RefreshTokenStore,
    code: &str,
    redirect_uri: &str,
) -> anyhow::Result<RefreshTokenRecord> {
    let code = code.trim();
    if code.is_empty() {
        anyhow::bail!("authorization code is empty");
    }
    let grant = endpoint
        .exchange_code(code, redirect_uri)
        .await
        .context("exchanging authorization code")?;
    let Some(refresh_token) = grant.refresh_token.filter(|t| !t.trim().is_empty()) else {
        anyhow::bail!(
            "provider issued no refresh token; revoke the app's access in the Google account and authorize again"
        );
    };
    store.save(&refresh_token).await
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    #[instrument(skip_all, fields(token_url = %self.config.token_url))]
    async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        self.post_form(&params).await
    }
}

/// Maps an OAuth error body onto the operator-facing taxonomy.
pub fn classify_token_error(status: u16, body: &str) -> AuthError {
    #[derive(Deserialize)]
    struct OAuthErrorBody {
        error: Option<String>,
        error_description: Option<String>,
    }

    let parsed = serde_json::from_str::<OAuthErrorBody>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_default();
    let detail = parsed
        .and_then(|b| b.error_description)
        .unwrap_or_else(|| format!("http {status}"));
    match code.as_str() {
        "invalid_client" => AuthError::BadCredentials(detail),
        "invalid_grant" => AuthError::RevokedGrant(detail),
        _ => AuthError::Unknown(format!("http {status}: {body}")),
    }
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error)]
pub enum AuthorizedRequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("access token rejected after refresh for {url}")]
    Unauthorized { url: String },
}

impl From<AuthorizedRequestError> for FetchError {
    fn from(err: AuthorizedRequestError) -> Self {
        match err {
            AuthorizedRequestError::Auth(e) if e.requires_reauthorization() => FetchError::Auth(e),
            AuthorizedRequestError::Auth(e) => FetchError::Transient(e.to_string()),
            AuthorizedRequestError::Http(e) => FetchError::Request(e),
            err @ AuthorizedRequestError::Unauthorized { .. } => FetchError::Aborted(err.to_string()),
        }
    }
}

/// Owns one provider's access token. The lock is held across a refresh so
/// concurrent callers wait for the same exchange instead of starting their own.
pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    store: RefreshTokenStore,
    clock: Arc<dyn Clock>,
    buffer: Duration,
    always_refresh: bool,
    force_refresh: AtomicBool,
    token: Mutex<Option<Token>>,
    refreshes: AtomicU64,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("store", &self.store)
            .field("always_refresh", &self.always_refresh)
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, store: RefreshTokenStore) -> Self {
        Self {
            endpoint,
            store,
            clock: Arc::new(SystemClock),
            buffer: Duration::seconds(TOKEN_EXPIRY_BUFFER_SECS),
            always_refresh: false,
            force_refresh: AtomicBool::new(false),
            token: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refresh on every call instead of reusing a cached token.
    pub fn with_always_refresh(mut self, always_refresh: bool) -> Self {
        self.always_refresh = always_refresh;
        self
    }

    pub fn store(&self) -> &RefreshTokenStore {
        &self.store
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Forces the next [`TokenManager::access_token`] call to refresh.
    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut slot = self.token.lock().await;
        let forced = self.force_refresh.swap(false, Ordering::SeqCst) || self.always_refresh;
        if !forced {
            if let Some(token) = slot.as_ref() {
                if token.is_usable_at(self.clock.now(), self.buffer) {
                    return Ok(token.access_token.clone());
                }
                debug!(expires_at = %token.expires_at, "access token inside expiry buffer");
            }
        }
        let token = self.refresh_locked(&mut slot).await?;
        Ok(token.access_token)
    }

    pub async fn refresh(&self) -> Result<String, AuthError> {
        let mut slot = self.token.lock().await;
        self.force_refresh.store(false, Ordering::SeqCst);
        let token = self.refresh_locked(&mut slot).await?;
        Ok(token.access_token)
    }

    /// Refreshes after `rejected` drew a 401, unless another request already replaced it.
    async fn refresh_rejected(&self, rejected: &str) -> Result<String, AuthError> {
        let mut slot = self.token.lock().await;
        if let Some(current) = slot.as_ref() {
            if current.access_token != rejected && current.is_usable_at(self.clock.now(), self.buffer) {
                debug!("access token already refreshed by a concurrent request");
                return Ok(current.access_token.clone());
            }
        }
        self.force_refresh.store(false, Ordering::SeqCst);
        let token = self.refresh_locked(&mut slot).await?;
        Ok(token.access_token)
    }

    async fn refresh_locked(&self, slot: &mut Option<Token>) -> Result<Token, AuthError> {
        info!(store = %self.store.path().display(), "refreshing access token");
        let record = self
            .store
            .load()
            .await
            .map_err(|e| AuthError::Unknown(format!("{e:#}")))?
            .ok_or_else(|| AuthError::MissingRefreshToken {
                path: self.store.path().display().to_string(),
            })?;

        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let grant = match self.endpoint.exchange(&record.refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                *slot = None;
                if err.requires_reauthorization() {
                    error!(error = %err, "access token refresh needs operator action");
                } else {
                    warn!(error = %err, "access token refresh failed");
                }
                return Err(err);
            }
        };

        let now = self.clock.now();
        let token = Token {
            access_token: grant.access_token,
            expires_at: now + Duration::seconds(grant.expires_in),
        };
        if !token.is_usable_at(now, self.buffer) {
            *slot = None;
            return Err(AuthError::Unknown(format!(
                "provider issued a token valid for {}s, inside the {}s safety buffer",
                grant.expires_in,
                self.buffer.num_seconds()
            )));
        }
        debug!(expires_at = %token.expires_at, "access token refreshed");
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Sends a bearer-authenticated request. A 401 triggers exactly one refresh
    /// and one resend; a second 401 is returned as an error.
    pub async fn send_authorized<F>(
        &self,
        build: F,
    ) -> Result<reqwest::Response, AuthorizedRequestError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.access_token().await?;
        let resp = build().bearer_auth(&token).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!(url = %resp.url(), "access token rejected, refreshing once");
        let token = self.refresh_rejected(&token).await?;
        let resp = build().bearer_auth(&token).send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthorizedRequestError::Unauthorized {
                url: resp.url().to_string(),
            });
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(StdMutex::new(now)))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct CountingEndpoint {
        calls: AtomicU32,
        ttl_secs: i64,
        failure: Option<AuthError>,
    }

    impl CountingEndpoint {
        fn ok(ttl_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                ttl_secs,
                failure: None,
            })
        }

        fn failing(err: AuthError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                ttl_secs: 3600,
                failure: Some(err),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            Ok(TokenGrant {
                access_token: format!("{refresh_token}-access-{n}"),
                expires_in: self.ttl_secs,
            })
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 15, 12, 0, 0).single().unwrap()
    }

    async fn seeded_store(dir: &tempfile::TempDir) -> RefreshTokenStore {
        let store = RefreshTokenStore::new(dir.path().join("tokens/google-refresh.json"));
        store.save("refresh-1").await.expect("save token");
        store
    }

    #[test]
    fn token_errors_are_classified_by_oauth_code() {
        assert_eq!(
            classify_token_error(401, r#"{"error":"invalid_client","error_description":"bad id"}"#),
            AuthError::BadCredentials("bad id".into())
        );
        assert!(matches!(
            classify_token_error(400, r#"{"error":"invalid_grant"}"#),
            AuthError::RevokedGrant(_)
        ));
        assert!(matches!(
            classify_token_error(503, "upstream down"),
            AuthError::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn store_round_trips_and_treats_blank_tokens_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = RefreshTokenStore::new(dir.path().join("nested/refresh.json"));
        assert!(store.load().await.unwrap().is_none());
        assert!(!store.exists().await);

        let saved = store.save("  abc  ").await.unwrap();
        assert_eq!(saved.refresh_token, "abc");
        assert_eq!(store.load().await.unwrap(), Some(saved));

        std::fs::write(
            store.path(),
            r#"{"refresh_token":"","created_at":"2025-09-15T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn one_refresh_per_expiry_cycle() {
        let dir = tempdir().expect("tempdir");
        let clock = ManualClock::at(noon());
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await)
            .with_clock(clock.clone());

        for _ in 0..10 {
            assert_eq!(manager.access_token().await.unwrap(), "refresh-1-access-1");
        }
        assert_eq!(endpoint.calls(), 1);

        // just over a minute of validity left
        clock.advance(Duration::minutes(58) + Duration::seconds(59));
        assert_eq!(manager.access_token().await.unwrap(), "refresh-1-access-1");
        assert_eq!(endpoint.calls(), 1);

        // 30 seconds before expiry falls inside the buffer
        clock.advance(Duration::seconds(31));
        assert_eq!(manager.access_token().await.unwrap(), "refresh-1-access-2");
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(manager.refresh_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = Arc::new(TokenManager::new(endpoint.clone(), seeded_store(&dir).await));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.access_token().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "refresh-1-access-1");
        }
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn forced_refresh_flag_bypasses_cache_once() {
        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await);

        manager.access_token().await.unwrap();
        manager.request_refresh();
        assert_eq!(manager.access_token().await.unwrap(), "refresh-1-access-2");
        manager.access_token().await.unwrap();
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_fatal_without_calling_provider() {
        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(
            endpoint.clone(),
            RefreshTokenStore::new(dir.path().join("absent.json")),
        );

        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::MissingRefreshToken { .. }));
        assert!(err.requires_reauthorization());
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn revoked_grant_surfaces_and_leaves_no_token() {
        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::failing(AuthError::RevokedGrant("revoked".into()));
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await);

        assert!(matches!(
            manager.access_token().await,
            Err(AuthError::RevokedGrant(_))
        ));
        assert!(manager.access_token().await.is_err());
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn token_shorter_than_buffer_is_never_returned() {
        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(30);
        let manager = TokenManager::new(endpoint, seeded_store(&dir).await);
        assert!(matches!(
            manager.access_token().await,
            Err(AuthError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn oauth_endpoint_posts_refresh_grant_and_maps_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=good"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.fresh",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=stale"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let endpoint = OAuthTokenEndpoint::new(
            reqwest::Client::new(),
            OAuthClientConfig {
                token_url: format!("{}/token", server.uri()),
                client_id: "client".into(),
                client_secret: SecretString::from("secret".to_string()),
            },
        );

        let grant = endpoint.exchange("good").await.unwrap();
        assert_eq!(grant.access_token, "ya29.fresh");
        assert_eq!(grant.expires_in, 3599);

        assert_eq!(
            endpoint.exchange("stale").await.unwrap_err(),
            AuthError::RevokedGrant("Token has been expired or revoked.".into())
        );
    }

    fn oauth_endpoint(token_url: String) -> OAuthTokenEndpoint {
        OAuthTokenEndpoint::new(
            reqwest::Client::new(),
            OAuthClientConfig {
                token_url,
                client_id: "client".into(),
                client_secret: SecretString::from("secret".to_string()),
            },
        )
    }

    #[test]
    fn consent_url_requests_offline_access() {
        let endpoint = oauth_endpoint(GOOGLE_TOKEN_URL.to_string());
        let url = endpoint
            .consent_url(
                GOOGLE_AUTH_URL,
                "http://localhost:3000/auth/callback",
                &[SEARCH_CONSOLE_SCOPE.to_string()],
            )
            .unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(query["client_id"], "client");
        assert_eq!(query["redirect_uri"], "http://localhost:3000/auth/callback");
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], SEARCH_CONSOLE_SCOPE);
        assert_eq!(query["access_type"], "offline");
        assert_eq!(query["prompt"], "consent");

        assert!(endpoint.consent_url("not a url", "x", &[]).is_err());
    }

    #[tokio::test]
    async fn authorization_code_is_exchanged_and_refresh_token_stored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=4%2F0Ab"))
            .and(body_string_contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fcallback"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.first",
                "expires_in": 3599,
                "refresh_token": "1//stored",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let store = RefreshTokenStore::new(dir.path().join("tokens/google-refresh.json"));
        let endpoint = oauth_endpoint(format!("{}/token", server.uri()));

        let record = complete_consent(&endpoint, &store, " 4/0Ab ", "http://localhost:3000/auth/callback")
            .await
            .unwrap();
        assert_eq!(record.refresh_token, "1//stored");
        assert_eq!(store.load().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn consent_without_refresh_token_stores_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.first",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/expired"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let store = RefreshTokenStore::new(dir.path().join("google-refresh.json"));

        let endpoint = oauth_endpoint(format!("{}/token", server.uri()));
        assert!(complete_consent(&endpoint, &store, "code", "urn:x").await.is_err());
        assert!(complete_consent(&endpoint, &store, "  ", "urn:x").await.is_err());

        let expired = oauth_endpoint(format!("{}/expired", server.uri()));
        assert!(matches!(
            expired.exchange_code("code", "urn:x").await,
            Err(AuthError::RevokedGrant(_))
        ));
        assert!(!store.exists().await);
    }

    #[test]
    fn reauthorization_errors_stay_typed_through_fetch() {
        let err = FetchError::from(AuthorizedRequestError::Auth(AuthError::RevokedGrant("x".into())));
        assert!(matches!(err, FetchError::Auth(AuthError::RevokedGrant(_))));
        let err = FetchError::from(AuthorizedRequestError::Auth(AuthError::Unknown("x".into())));
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[tokio::test]
    async fn unauthorized_response_refreshes_once_and_resends() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .and(header("authorization", "Bearer refresh-1-access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"siteEntry": []})))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await);
        let client = reqwest::Client::new();
        let url = format!("{}/sites", server.uri());

        let resp = manager.send_authorized(|| client.get(&url)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_unauthorized_responses_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .and(header("authorization", "Bearer refresh-1-access-1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .and(header("authorization", "Bearer refresh-1-access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"siteEntry": []})))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await);
        let client = reqwest::Client::new();
        let url = format!("{}/sites", server.uri());

        let (a, b, c) = tokio::join!(
            manager.send_authorized(|| client.get(&url)),
            manager.send_authorized(|| client.get(&url)),
            manager.send_authorized(|| client.get(&url)),
        );
        for resp in [a, b, c] {
            assert_eq!(resp.unwrap().status(), StatusCode::OK);
        }
        // one exchange for the initial token, one after the first 401
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_unauthorized_is_retried_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir");
        let endpoint = CountingEndpoint::ok(3600);
        let manager = TokenManager::new(endpoint.clone(), seeded_store(&dir).await);
        let client = reqwest::Client::new();
        let url = format!("{}/sites", server.uri());

        let err = manager.send_authorized(|| client.get(&url)).await.unwrap_err();
        assert!(matches!(err, AuthorizedRequestError::Unauthorized { .. }));
        assert!(matches!(FetchError::from(err), FetchError::Aborted(_)));
        assert_eq!(endpoint.calls(), 2);
    }
}
