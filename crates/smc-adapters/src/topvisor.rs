//! Rank-tracker positions: one POST per (project, region) pair, batched under the provider's
//! concurrency ceiling.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use smc_core::{CollectorError, ConfigError, DateRange, NormalizedRecord, RecordError, Scalar};
use smc_fetch::{BatchConfig, BatchFetcher, FetchError, FetchRequest, JsonHttpClient, RequestExecutor};
use smc_storage::{ContentSpec, DimensionSpec, ReconciliationEngine, TableSpec};
use tracing::{error, info, warn};

use crate::{required_env, secret_env, Fetched, RawRecord, SourceAdapter};

pub const SERVICE_NAME: &str = "topvisor";

/// Position value the provider reports for "not ranked".
const UNRANKED: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopvisorRequestSpec {
    pub name: String,
    pub project_id: i64,
    pub region_index: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopvisorSettings {
    /// Project id to display name.
    pub projects: BTreeMap<i64, String>,
    /// Region index to search engine name.
    pub regions: BTreeMap<i64, String>,
    pub requests: Vec<TopvisorRequestSpec>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_secs")]
    pub batch_delay_secs: u64,
}

fn default_batch_size() -> usize {
    4
}

fn default_batch_delay_secs() -> u64 {
    5
}

impl Default for TopvisorSettings {
    fn default() -> Self {
        let projects = [
            (11430357, "Terms"),
            (7093082, "Blog"),
            (7063718, "DDG-EN"),
            (7063822, "DDG-RU"),
        ];
        let regions = [(5, "Yandex"), (7, "Google"), (159, "Google"), (701, "Bing")];
        let requests = [
            ("RU site / Yandex", 7063822, 5),
            ("RU site / Google", 7063822, 7),
            ("EN site / Google", 7063718, 159),
            ("EN site / Bing", 7063718, 701),
            ("Blog / Yandex", 7093082, 5),
            ("Blog / Google", 7093082, 7),
            ("Terms / Yandex", 11430357, 5),
            ("Terms / Google", 11430357, 7),
        ];
        Self {
            projects: projects
                .into_iter()
                .map(|(id, name)| (id, name.to_string()))
                .collect(),
            regions: regions
                .into_iter()
                .map(|(idx, engine)| (idx, engine.to_string()))
                .collect(),
            requests: requests
                .into_iter()
                .map(|(name, project_id, region_index)| TopvisorRequestSpec {
                    name: format!("positions: {name}"),
                    project_id,
                    region_index,
                })
                .collect(),
            batch_size: default_batch_size(),
            batch_delay_secs: default_batch_delay_secs(),
        }
    }
}

impl TopvisorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests.is_empty() {
            return Err(ConfigError::Invalid {
                name: "topvisor.requests".to_string(),
                reason: "no requests configured".to_string(),
            });
        }
        for request in &self.requests {
            if !self.projects.contains_key(&request.project_id) {
                return Err(ConfigError::Invalid {
                    name: "topvisor.requests".to_string(),
                    reason: format!("{} uses unknown project {}", request.name, request.project_id),
                });
            }
            if !self.regions.contains_key(&request.region_index) {
                return Err(ConfigError::Invalid {
                    name: "topvisor.requests".to_string(),
                    reason: format!("{} uses unknown region {}", request.name, request.region_index),
                });
            }
        }
        Ok(())
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            inter_batch_delay: std::time::Duration::from_secs(self.batch_delay_secs),
            ..BatchConfig::default()
        }
    }
}

#[derive(Debug)]
pub struct TopvisorCredentials {
    pub api_url: String,
    pub api_key: SecretString,
    pub user_id: String,
}

impl TopvisorCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: required_env("TOPVISOR_API_URL")?,
            api_key: secret_env("TOPVISOR_API_KEY")?,
            user_id: required_env("TOPVISOR_USER_ID")?,
        })
    }

    fn headers(&self) -> Result<HeaderMap, ConfigError> {
        let invalid = |name: &str| ConfigError::Invalid {
            name: name.to_string(),
            reason: "not a valid header value".to_string(),
        };
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|_| invalid("TOPVISOR_API_KEY"))?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(
            "user-id",
            HeaderValue::from_str(&self.user_id).map_err(|_| invalid("TOPVISOR_USER_ID"))?,
        );
        Ok(headers)
    }
}

#[derive(Debug, Clone)]
pub struct PositionsRequest {
    pub spec: TopvisorRequestSpec,
    pub body: JsonValue,
}

impl FetchRequest for PositionsRequest {
    fn name(&self) -> &str {
        &self.spec.name
    }
}

pub fn positions_body(spec: &TopvisorRequestSpec, range: &DateRange) -> JsonValue {
    json!({
        "project_id": spec.project_id.to_string(),
        "regions_indexes": [spec.region_index.to_string()],
        "date1": range.start.format("%Y-%m-%d").to_string(),
        "date2": range.end.format("%Y-%m-%d").to_string(),
        "positions_fields": ["relevant_url", "position", "snippet"],
        "show_groups": true,
    })
}

/// Splits a positions response into one raw row per keyword and date/project/region entry.
/// Keywords without position data are dropped; non-object keywords are passed through so
/// validation counts them.
pub fn explode_keywords(body: &JsonValue) -> Vec<RawRecord> {
    let Some(keywords) = body.pointer("/result/keywords").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    for keyword in keywords {
        let Some(object) = keyword.as_object() else {
            rows.push(keyword.clone());
            continue;
        };
        let name = object.get("name").cloned().unwrap_or(JsonValue::Null);
        let Some(positions) = object.get("positionsData").and_then(JsonValue::as_object) else {
            continue;
        };
        for (key, entry) in positions {
            let mut single = Map::new();
            single.insert(key.clone(), entry.clone());
            rows.push(json!({ "keywordName": name.clone(), "positionData": single }));
        }
    }
    rows
}

fn parse_position(value: Option<&JsonValue>) -> Result<Scalar, RecordError> {
    match value {
        None | Some(JsonValue::Null) => Ok(Scalar::Null),
        Some(JsonValue::String(s)) if s.trim() == UNRANKED || s.trim().is_empty() => Ok(Scalar::Null),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|_| RecordError::Invalid(format!("position {s:?} is not a number"))),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(Scalar::Int)
            .ok_or_else(|| RecordError::Invalid(format!("position {n} is not an integer"))),
        Some(other) => Err(RecordError::Invalid(format!("unexpected position {other}"))),
    }
}

struct PositionKey {
    event_date: NaiveDate,
    project_id: i64,
    region_index: i64,
}

fn parse_position_key(key: &str) -> Result<PositionKey, RecordError> {
    let invalid = || RecordError::Invalid(format!("malformed position key {key:?}"));
    let mut parts = key.split(':');
    let (Some(date), Some(project), Some(region), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    Ok(PositionKey {
        event_date: NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?,
        project_id: project.parse().map_err(|_| invalid())?,
        region_index: region.parse().map_err(|_| invalid())?,
    })
}

pub struct TopvisorAdapter {
    settings: TopvisorSettings,
    api_url: String,
    headers: HeaderMap,
    http: JsonHttpClient,
    fetcher: BatchFetcher,
    table: TableSpec,
    project_regions: DimensionSpec,
    snippets: ContentSpec,
}

impl TopvisorAdapter {
    pub fn new(
        settings: TopvisorSettings,
        credentials: &TopvisorCredentials,
        http: JsonHttpClient,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let allowed = settings
            .requests
            .iter()
            .map(|r| vec![r.project_id.to_string(), r.region_index.to_string()]);
        let project_regions = DimensionSpec::new(
            "project region",
            "topvisor.project_regions",
            &["project_id", "region_index"],
        )
        .with_labels(&["project_name", "search_engine"])
        .with_allowed(allowed);
        Ok(Self {
            fetcher: BatchFetcher::new(settings.batch_config()),
            headers: credentials.headers()?,
            api_url: credentials.api_url.clone(),
            http,
            table: TableSpec::new(
                "topvisor.positions",
                &["request", "event_date", "project_region_id"],
                &["position", "relevant_url", "snippet_id"],
            )
            .with_touch_column("updated_at"),
            project_regions,
            snippets: ContentSpec::new("topvisor.snippets"),
            settings,
        })
    }

    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.fetcher = BatchFetcher::new(config);
        self
    }

    fn labels(&self, project_id: i64, region_index: i64) -> [Scalar; 2] {
        let project = self
            .settings
            .projects
            .get(&project_id)
            .cloned()
            .unwrap_or_else(|| project_id.to_string());
        let engine = self
            .settings
            .regions
            .get(&region_index)
            .cloned()
            .unwrap_or_else(|| region_index.to_string());
        [Scalar::from(project), Scalar::from(engine)]
    }
}

#[async_trait]
impl RequestExecutor<PositionsRequest> for TopvisorAdapter {
    type Output = JsonValue;

    async fn execute(&self, request: &PositionsRequest) -> Result<JsonValue, FetchError> {
        let body = self
            .http
            .post_json(&self.api_url, self.headers.clone(), &request.body)
            .await?;
        match body.get("errors").and_then(JsonValue::as_array) {
            Some(errors) if !errors.is_empty() => Err(FetchError::Transient(format!(
                "{} rejected: {}",
                request.spec.name,
                JsonValue::Array(errors.clone())
            ))),
            _ => Ok(body),
        }
    }
}

#[async_trait]
impl SourceAdapter for TopvisorAdapter {
    fn service_name(&self) -> &str {
        SERVICE_NAME
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    async fn check_connection(&self) -> Result<(), CollectorError> {
        self.http
            .post_json(&self.api_url, self.headers.clone(), &json!({ "show": "info" }))
            .await
            .map_err(|err| CollectorError::Connectivity(format!("topvisor api unavailable: {err}")))?;
        info!("topvisor api reachable");
        Ok(())
    }

    async fn fetch(&self, range: &DateRange) -> Result<Fetched, CollectorError> {
        let requests = self
            .settings
            .requests
            .iter()
            .map(|spec| PositionsRequest {
                spec: spec.clone(),
                body: positions_body(spec, range),
            })
            .collect::<Vec<_>>();
        info!(range = %range, requests = requests.len(), "fetching topvisor positions");

        let mut fetched = Fetched::default();
        for outcome in self.fetcher.fetch_all(requests, self).await {
            match outcome.result {
                Ok(body) => {
                    let rows = explode_keywords(&body);
                    if rows.is_empty() {
                        warn!(request = %outcome.request.spec.name, "empty positions result");
                    }
                    fetched.records.extend(rows);
                }
                Err(err) => {
                    error!(
                        request = %outcome.request.spec.name,
                        attempts = outcome.attempts,
                        error = %err,
                        "positions request failed"
                    );
                    fetched
                        .failures
                        .push(format!("{}: {err}", outcome.request.spec.name));
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
        let Some(object) = raw.as_object() else {
            return Ok(None);
        };
        let Some(request) = object
            .get("keywordName")
            .and_then(JsonValue::as_str)
            .filter(|name| !name.trim().is_empty())
        else {
            return Ok(None);
        };
        let Some(position_data) = object.get("positionData").and_then(JsonValue::as_object) else {
            return Ok(None);
        };
        let mut entries = position_data.iter();
        let (Some((key, entry)), None) = (entries.next(), entries.next()) else {
            return Err(RecordError::Invalid(format!(
                "expected one position entry, got {}",
                position_data.len()
            )));
        };
        let key = parse_position_key(key)?;
        let Some(entry) = entry.as_object() else {
            return Err(RecordError::Invalid("position entry is not an object".to_string()));
        };

        let position = parse_position(entry.get("position"))?;
        let relevant_url = entry
            .get("relevant_url")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let snippet = entry
            .get("snippet")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();

        let project_region_id = reconciler
            .resolve_dimension(
                &self.project_regions,
                &[Scalar::Int(key.project_id), Scalar::Int(key.region_index)],
                &self.labels(key.project_id, key.region_index),
            )
            .await?;
        let snippet_id = reconciler.resolve_content(&self.snippets, snippet).await?;

        Ok(Some(
            NormalizedRecord::new()
                .with("request", request)
                .with("event_date", key.event_date)
                .with("project_region_id", project_region_id)
                .with("position", position)
                .with("relevant_url", relevant_url)
                .with("snippet_id", snippet_id),
        ))
    }
}
