//! Search Console analytics, one query per day, authorized through the shared token manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use smc_auth::{AuthorizedRequestError, TokenManager};
use smc_core::{AuthError, CollectorError, ConfigError, DateRange, NormalizedRecord, RecordError, Scalar};
use smc_fetch::{read_json, BatchConfig, BatchFetcher, FetchError, FetchRequest, RequestExecutor};
use smc_storage::{DimensionSpec, ReconciliationEngine, TableSpec};
use tracing::{error, info, warn};

use crate::{Fetched, RawRecord, SourceAdapter};

pub const SERVICE_NAME: &str = "gsc";

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConsoleSettings {
    pub site_url: String,
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    #[serde(default = "default_sites_url")]
    pub sites_url: String,
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default = "default_data_state")]
    pub data_state: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<String>,
    #[serde(default = "default_row_limit")]
    pub row_limit: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_endpoint() -> String {
    "https://www.googleapis.com/webmasters/v3".to_string()
}

fn default_sites_url() -> String {
    "https://www.googleapis.com/webmasters/v3/sites".to_string()
}

fn default_search_type() -> String {
    "web".to_string()
}

fn default_data_state() -> String {
    "final".to_string()
}

fn default_dimensions() -> Vec<String> {
    vec!["date".into(), "query".into(), "page".into()]
}

fn default_row_limit() -> u32 {
    25_000
}

fn default_timeout_secs() -> u64 {
    30
}

impl SearchConsoleSettings {
    pub fn new(site_url: &str) -> Self {
        Self {
            site_url: site_url.to_string(),
            api_endpoint: default_api_endpoint(),
            sites_url: default_sites_url(),
            search_type: default_search_type(),
            data_state: default_data_state(),
            dimensions: default_dimensions(),
            row_limit: default_row_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }

    fn query_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            name: "gsc.api_endpoint".to_string(),
            reason,
        };
        let mut url = Url::parse(&self.api_endpoint).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("endpoint cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["sites", self.site_url.as_str(), "searchAnalytics", "query"]);
        Ok(url)
    }

    fn key_layout(&self) -> Result<KeyLayout, ConfigError> {
        let find = |name: &str| {
            self.dimensions
                .iter()
                .position(|d| d == name)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "gsc.dimensions".to_string(),
                    reason: format!("{name} dimension is required"),
                })
        };
        Ok(KeyLayout {
            date: find("date")?,
            query: find("query")?,
            page: find("page")?,
        })
    }
}

/// Positions of the business-key parts inside a response row's `keys` array.
#[derive(Debug, Clone, Copy)]
struct KeyLayout {
    date: usize,
    query: usize,
    page: usize,
}

#[derive(Debug, Clone)]
pub struct DayQuery {
    pub day: NaiveDate,
    name: String,
}

impl DayQuery {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            name: format!("search analytics {day}"),
        }
    }
}

impl FetchRequest for DayQuery {
    fn name(&self) -> &str {
        &self.name
    }
}

fn count(value: Option<&JsonValue>) -> Scalar {
    match value.and_then(JsonValue::as_f64) {
        Some(v) if v.fract() == 0.0 => Scalar::Int(v as i64),
        Some(v) => Scalar::Float(v),
        None => Scalar::Null,
    }
}

fn metric(value: Option<&JsonValue>) -> Scalar {
    value
        .and_then(JsonValue::as_f64)
        .map(Scalar::Float)
        .unwrap_or(Scalar::Null)
}

pub struct SearchConsoleAdapter {
    settings: SearchConsoleSettings,
    tokens: Arc<TokenManager>,
    client: reqwest::Client,
    fetcher: BatchFetcher,
    refresh_on_start: bool,
    query_url: Url,
    layout: KeyLayout,
    table: TableSpec,
    pages: DimensionSpec,
}

impl SearchConsoleAdapter {
    pub fn new(
        settings: SearchConsoleSettings,
        tokens: Arc<TokenManager>,
        client: reqwest::Client,
    ) -> Result<Self, ConfigError> {
        if settings.site_url.trim().is_empty() {
            return Err(ConfigError::Missing("gsc.site_url".to_string()));
        }
        Ok(Self {
            query_url: settings.query_url()?,
            layout: settings.key_layout()?,
            tokens,
            client,
            fetcher: BatchFetcher::default(),
            refresh_on_start: false,
            table: TableSpec::new(
                "gsc.search_console",
                &["event_date", "request", "target_url"],
                &["clicks", "impressions", "ctr", "position"],
            )
            .with_touch_column("updated_at"),
            pages: DimensionSpec::new("site page", "common.site_map", &["url"]),
            settings,
        })
    }

    pub fn with_refresh_on_start(mut self, refresh_on_start: bool) -> Self {
        self.refresh_on_start = refresh_on_start;
        self
    }

    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.fetcher = BatchFetcher::new(config);
        self
    }

    pub fn query_body(&self, day: NaiveDate) -> JsonValue {
        let day = day.format("%Y-%m-%d").to_string();
        json!({
            "startDate": day,
            "endDate": day,
            "type": self.settings.search_type,
            "dataState": self.settings.data_state,
            "dimensions": self.settings.dimensions,
            "rowLimit": self.settings.row_limit,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }
}

#[async_trait]
impl RequestExecutor<DayQuery> for SearchConsoleAdapter {
    type Output = JsonValue;

    async fn execute(&self, request: &DayQuery) -> Result<JsonValue, FetchError> {
        let body = self.query_body(request.day);
        let resp = self
            .tokens
            .send_authorized(|| {
                self.client
                    .post(self.query_url.clone())
                    .timeout(self.timeout())
                    .json(&body)
            })
            .await?;
        read_json(resp).await
    }
}

#[async_trait]
impl SourceAdapter for SearchConsoleAdapter {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    async fn prepare(&self) -> Result<(), CollectorError> {
        let store = self.tokens.store();
        if !store.exists().await {
            let path = store.path().display().to_string();
            error!(path = %path, "no refresh token stored; run `smc authorize` first");
            return Err(AuthError::MissingRefreshToken { path }.into());
        }
        if self.refresh_on_start {
            info!("refreshing access token before run");
            self.tokens.refresh().await?;
        }
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), CollectorError> {
        let resp = self
            .tokens
            .send_authorized(|| self.client.get(&self.settings.sites_url).timeout(self.timeout()))
            .await
            .map_err(|err| match err {
                AuthorizedRequestError::Auth(auth) => CollectorError::Auth(auth),
                other => CollectorError::Connectivity(format!("search console unavailable: {other}")),
            })?;
        read_json(resp)
            .await
            .map_err(|err| CollectorError::Connectivity(format!("search console unavailable: {err}")))?;
        info!("search console api reachable");
        Ok(())
    }

    async fn fetch(&self, range: &DateRange) -> Result<Fetched, CollectorError> {
        // fatal credential problems surface here instead of once per request
        self.tokens.access_token().await?;

        let requests = range.days().into_iter().map(DayQuery::new).collect::<Vec<_>>();
        info!(range = %range, site = %self.settings.site_url, requests = requests.len(), "fetching search analytics");

        let mut fetched = Fetched::default();
        for outcome in self.fetcher.fetch_all(requests, self).await {
            match outcome.result {
                Ok(body) => match body.get("rows").and_then(JsonValue::as_array) {
                    Some(rows) if !rows.is_empty() => fetched.records.extend(rows.iter().cloned()),
                    _ => warn!(day = %outcome.request.day, "no search analytics rows"),
                },
                // the grant went bad mid-run; partial data is not worth keeping
                Err(FetchError::Auth(auth)) => {
                    error!(day = %outcome.request.day, error = %auth, "authorization lost during fetch");
                    return Err(auth.into());
                }
                Err(err) => {
                    error!(day = %outcome.request.day, attempts = outcome.attempts, error = %err, "search analytics query failed");
                    fetched.failures.push(format!("{}: {err}", outcome.request.name()));
                }
            }
        }
        Ok(fetched)
    }

    async fn validate(
        &self,
        raw: &RawRecord,
        reconciler: &mut ReconciliationEngine,
    ) -> Result<Option<NormalizedRecord>, RecordError> {
        let Some(keys) = raw.get("keys").and_then(JsonValue::as_array) else {
            return Ok(None);
        };
        let key = |idx: usize| keys.get(idx).and_then(JsonValue::as_str);
        let (Some(date), Some(query), Some(page)) = (
            key(self.layout.date),
            key(self.layout.query),
            key(self.layout.page),
        ) else {
            return Ok(None);
        };
        let event_date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| RecordError::Invalid(format!("bad date {date:?}")))?;
        if page.trim().is_empty() {
            return Err(RecordError::Invalid("empty page url".to_string()));
        }

        let target_url = reconciler
            .resolve_dimension(&self.pages, &[Scalar::from(page)], &[])
            .await?;

        Ok(Some(
            NormalizedRecord::new()
                .with("event_date", event_date)
                .with("request", query)
                .with("target_url", target_url)
                .with("clicks", count(raw.get("clicks")))
                .with("impressions", count(raw.get("impressions")))
                .with("ctr", metric(raw.get("ctr")))
                .with("position", metric(raw.get("position"))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use smc_auth::{OAuthClientConfig, OAuthTokenEndpoint, RefreshTokenStore};
    use smc_fetch::RetryPolicy;
    use smc_storage::{MemoryGateway, PersistenceGateway};
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn token_manager(server: &MockServer, dir: &TempDir, store_token: bool) -> Arc<TokenManager> {
        let store = RefreshTokenStore::new(dir.path().join("google-refresh.json"));
        if store_token {
            store.save("refresh-1").await.unwrap();
        }
        let endpoint = OAuthTokenEndpoint::new(
            reqwest::Client::new(),
            OAuthClientConfig {
                token_url: format!("{}/token", server.uri()),
                client_id: "client".into(),
                client_secret: SecretString::from("secret".to_string()),
            },
        );
        Arc::new(TokenManager::new(Arc::new(endpoint), store))
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "access-1", "expires_in": 3599})),
            )
            .mount(server)
            .await;
    }

    fn settings(server: &MockServer) -> SearchConsoleSettings {
        SearchConsoleSettings {
            api_endpoint: server.uri(),
            sites_url: format!("{}/sites", server.uri()),
            ..SearchConsoleSettings::new("sc-domain:example.com")
        }
    }

    fn no_retry() -> BatchConfig {
        BatchConfig {
            batch_size: 4,
            inter_batch_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        }
    }

    #[test]
    fn query_url_keeps_site_as_one_segment() {
        let url = SearchConsoleSettings::new("https://example.com/").query_url().unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/webmasters/v3/sites/https:%2F%2Fexample.com%2F/searchAnalytics/query"
        );
    }

    #[test]
    fn page_dimension_is_required() {
        let mut settings = SearchConsoleSettings::new("sc-domain:example.com");
        settings.dimensions = vec!["date".into(), "query".into()];
        assert!(settings.key_layout().is_err());
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_before_any_request() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, false).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens, reqwest::Client::new()).unwrap();
        let err = adapter.prepare().await.unwrap_err();
        assert!(matches!(err, CollectorError::Auth(AuthError::MissingRefreshToken { .. })));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_on_start_exchanges_eagerly() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, true).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens.clone(), reqwest::Client::new())
            .unwrap()
            .with_refresh_on_start(true);
        adapter.prepare().await.unwrap();
        assert_eq!(tokens.refresh_count(), 1);
    }

    #[tokio::test]
    async fn fetch_queries_each_day_with_bearer_token() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("POST"))
            .and(path_regex(r"/sites/.+/searchAnalytics/query$"))
            .and(header("authorization", "Bearer access-1"))
            .and(body_partial_json(json!({"startDate": "2025-09-14", "rowLimit": 25000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": [
                {"keys": ["2025-09-14", "shoes", "https://example.com/a"], "clicks": 3, "impressions": 40, "ctr": 0.075, "position": 4.2},
                {"keys": ["2025-09-14", "boots", "https://example.com/b"], "clicks": 0, "impressions": 9, "ctr": 0.0, "position": 11.0}
            ]})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"/searchAnalytics/query$"))
            .and(body_partial_json(json!({"startDate": "2025-09-15"})))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, true).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens.clone(), reqwest::Client::new())
            .unwrap()
            .with_batch_config(no_retry());
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2025, 9, 14).unwrap(),
            NaiveDate::from_ymd_opt(2025, 9, 15).unwrap(),
        )
        .unwrap();
        let fetched = adapter.fetch(&range).await.unwrap();
        assert_eq!(fetched.records.len(), 2);
        assert_eq!(fetched.failures.len(), 1);
        assert_eq!(tokens.refresh_count(), 1);
    }

    #[tokio::test]
    async fn grant_revoked_mid_run_fails_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "access-1", "expires_in": 3599})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"/searchAnalytics/query$"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, true).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens.clone(), reqwest::Client::new())
            .unwrap()
            .with_batch_config(no_retry());
        let range = DateRange::single(NaiveDate::from_ymd_opt(2025, 9, 15).unwrap());

        let err = adapter.fetch(&range).await.unwrap_err();
        assert!(matches!(err, CollectorError::Auth(AuthError::RevokedGrant(_))));
        assert!(err.is_fatal());
        assert_eq!(tokens.refresh_count(), 2);
    }

    #[tokio::test]
    async fn rows_resolve_pages_through_site_map() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, true).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens, reqwest::Client::new()).unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.connect().await.unwrap();
        let mut engine = ReconciliationEngine::new(gateway.clone());

        let row = json!({"keys": ["2025-09-14", "shoes", "https://example.com/a"], "clicks": 3, "impressions": 40, "ctr": 0.075, "position": 4.2});
        let first = adapter.validate(&row, &mut engine).await.unwrap().unwrap();
        let again = adapter.validate(&row, &mut engine).await.unwrap().unwrap();
        assert_eq!(first.get("target_url"), again.get("target_url"));
        assert_eq!(first.get("clicks"), Some(&Scalar::Int(3)));
        assert_eq!(first.get("position"), Some(&Scalar::Float(4.2)));
        assert_eq!(gateway.dimension_rows("common.site_map").len(), 1);

        assert!(adapter.validate(&json!({"keys": ["2025-09-14"]}), &mut engine).await.unwrap().is_none());
        assert!(adapter.validate(&json!(42), &mut engine).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connection_check_lists_sites() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("GET"))
            .and(path("/sites"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"siteEntry": []})))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let tokens = token_manager(&server, &dir, true).await;
        let adapter = SearchConsoleAdapter::new(settings(&server), tokens, reqwest::Client::new()).unwrap();
        adapter.check_connection().await.unwrap();
    }
}
