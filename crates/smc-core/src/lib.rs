//! Core data model and error taxonomy shared by every collector crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smc-core";

/// Access tokens are treated as expired this many seconds before their real expiry.
pub const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;

/// Scalar value stored in a normalized record column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts a JSON leaf into a scalar. Arrays and objects have no scalar form.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Scalar::Null),
            JsonValue::Bool(b) => Some(Scalar::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            JsonValue::String(s) => Some(Scalar::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    /// Text form used when composing business keys.
    pub fn key_fragment(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Date(d) => d.format("%Y-%m-%d").to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(value: NaiveDate) -> Self {
        Scalar::Date(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// Flat field-name to scalar mapping handed from adapters to persistence.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct NormalizedRecord {
    fields: BTreeMap<String, Scalar>,
}

impl NormalizedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Joins the given columns into a business key; absent columns contribute an empty fragment.
    pub fn key_for(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.get(c).map(Scalar::key_fragment).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Inclusive range of calendar days a run collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if end < start {
            return Err(ConfigError::Invalid {
                name: "date range".to_string(),
                reason: format!("end {end} precedes start {start}"),
            });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// One-day range shifted from `today` by `offset_days` (negative is the past).
    pub fn offset_from(today: NaiveDate, offset_days: i64) -> Self {
        Self::single(today + Duration::days(offset_days))
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|d| *d <= self.end)
            .collect()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub range: DateRange,
    pub manual_mode: bool,
    pub force_override: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub fetch_failures: u64,
    pub warnings: Vec<String>,
}

impl RunStats {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// State of one collector invocation. Never shared between runs.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub service_name: String,
    pub options: RunOptions,
    pub started_at: DateTime<Utc>,
    pub stats: RunStats,
}

impl CollectionRun {
    pub fn start(service_name: impl Into<String>, options: RunOptions) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            service_name: service_name.into(),
            options,
            started_at: Utc::now(),
            stats: RunStats::default(),
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// True while at least `buffer` of validity remains at `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer < self.expires_at
    }
}

/// Durable refresh credential written by the out-of-band authorization step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("unknown service {0}")]
    UnknownService(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no refresh token at {path}; run `smc store-token` to authorize")]
    MissingRefreshToken { path: String },
    #[error("token endpoint rejected client credentials: {0}")]
    BadCredentials(String),
    #[error("refresh token revoked or invalid: {0}")]
    RevokedGrant(String),
    #[error("token refresh failed: {0}")]
    Unknown(String),
}

impl AuthError {
    /// Conditions only an operator can fix.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            AuthError::MissingRefreshToken { .. }
                | AuthError::BadCredentials(_)
                | AuthError::RevokedGrant(_)
        )
    }
}

/// Failure confined to one record; counted and skipped, never run-fatal.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("no {dimension} mapping configured for key {key}")]
    UnmappedDimension { dimension: String, key: String },
    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Run-fatal errors surfaced by a collector run.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("connectivity check failed: {0}")]
    Connectivity(String),
    #[error("upstream api error: {0}")]
    TransientApi(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CollectorError {
    /// False only for failures a later run may get past without operator action.
    pub fn is_fatal(&self) -> bool {
        match self {
            CollectorError::Auth(err) => err.requires_reauthorization(),
            CollectorError::TransientApi(_) => false,
            _ => true,
        }
    }
}
