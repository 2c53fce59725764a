//! Run orchestration: per-service collector runtime, multi-service runner, scheduler and
//! notifications.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use smc_adapters::{SearchConsoleSettings, TopvisorSettings};
use secrecy::SecretString;
use smc_auth::{OAuthClientConfig, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, SEARCH_CONSOLE_SCOPE};
use smc_core::{ConfigError, DateRange, RunOptions};
use smc_fetch::HttpClientConfig;
use tokio::fs;
use tracing::{info, warn};

mod notify;
mod runner;
mod runtime;

pub use notify::{
    notifier_from_env, LogNotifier, NotificationSink, TelegramConfig, TelegramNotifier,
    TELEGRAM_API_BASE,
};
pub use runner::{
    check_services, maybe_build_scheduler, probe_storage, run_services, AdapterFactory,
    EnvAdapterFactory, RunReport, ServiceCheck, ServiceOutcome, ServiceRunner,
};
pub use runtime::{CollectorRuntime, RunFailure, RunState, DEFAULT_PROGRESS_EVERY};

pub const CRATE_NAME: &str = "smc-sync";

pub const DEFAULT_SYNC_CRON: &str = "0 0 8 * * *";
pub const DEFAULT_REFRESH_TOKEN_PATH: &str = "./tokens/google-refresh.json";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/auth/callback";

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct GoogleAuthConfig {
    pub token_url: String,
    pub auth_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub refresh_token_path: PathBuf,
    /// Refresh before every request instead of caching the access token.
    pub force_refresh: bool,
    pub refresh_on_start: bool,
}

impl GoogleAuthConfig {
    pub fn from_env() -> Self {
        Self {
            token_url: env_nonempty("GOOGLE_TOKEN_URL").unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
            auth_url: env_nonempty("GOOGLE_AUTH_URL").unwrap_or_else(|| GOOGLE_AUTH_URL.to_string()),
            redirect_uri: env_nonempty("GOOGLE_REDIRECT_URI")
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            scopes: parse_scopes(
                [env_nonempty("GA4_SCOPES"), env_nonempty("GSC_SCOPES")]
                    .into_iter()
                    .flatten(),
            ),
            refresh_token_path: env_nonempty("GOOGLE_REFRESH_TOKEN_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REFRESH_TOKEN_PATH)),
            force_refresh: env_flag("GOOGLE_TOKEN_FORCE_REFRESH"),
            refresh_on_start: env_flag("GOOGLE_TOKEN_REFRESH_ON_START"),
        }
    }

    /// Client credentials come from GOOGLE_CLIENT_ID / GOOGLE_CLIENT_SECRET.
    pub fn oauth_client(&self) -> Result<OAuthClientConfig, ConfigError> {
        let required = |name: &str| env_nonempty(name).ok_or_else(|| ConfigError::Missing(name.to_string()));
        Ok(OAuthClientConfig {
            token_url: self.token_url.clone(),
            client_id: required("GOOGLE_CLIENT_ID")?,
            client_secret: SecretString::from(required("GOOGLE_CLIENT_SECRET")?),
        })
    }
}

/// Splits whitespace-separated scope lists, dropping repeats. Falls back to read-only Search Console.
fn parse_scopes(lists: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for list in lists {
        for scope in list.split_whitespace() {
            if !scopes.iter().any(|s| s == scope) {
                scopes.push(scope.to_string());
            }
        }
    }
    if scopes.is_empty() {
        scopes.push(SEARCH_CONSOLE_SCOPE.to_string());
    }
    scopes
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Pause between two services of one runner invocation.
    pub service_pause: Duration,
    pub google: GoogleAuthConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: env_nonempty("SMC_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            scheduler_enabled: env_flag("SMC_SCHEDULER_ENABLED"),
            sync_cron: env_nonempty("SMC_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: env_nonempty("SMC_USER_AGENT")
                .unwrap_or_else(|| format!("smc-collector/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: std::env::var("SMC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            service_pause: Duration::from_secs(2),
            google: GoogleAuthConfig::from_env(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("services.yaml")
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.workspace_root.join("schema")
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_date_offset() -> i64 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Days relative to today used for both ends of a non-manual run.
    #[serde(default = "default_date_offset")]
    pub date_offset: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topvisor: Option<TopvisorSettings>,
    #[serde(default)]
    pub gsc: Option<SearchConsoleSettings>,
}

impl ServiceConfig {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            priority,
            date_offset: default_date_offset(),
            description: None,
            topvisor: None,
            gsc: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRegistry {
    pub services: Vec<ServiceConfig>,
}

impl ServiceRegistry {
    /// Used when no `services.yaml` exists.
    pub fn builtin() -> Self {
        let mut topvisor = ServiceConfig::new(smc_adapters::topvisor::SERVICE_NAME, 1);
        topvisor.description = Some("TopVisor keyword positions".to_string());
        topvisor.topvisor = Some(TopvisorSettings::default());
        let mut gsc = ServiceConfig::new(smc_adapters::search_console::SERVICE_NAME, 2);
        gsc.description = Some("Google Search Console analytics".to_string());
        Self {
            services: vec![topvisor, gsc],
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "service registry not found, using built-in services");
                return Ok(Self::builtin());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.validate()?;
        info!(path = %path.display(), services = registry.services.len(), "service registry loaded");
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                bail!("service {} is declared twice", service.name);
            }
        }
        Ok(())
    }

    /// Explicit names in the given order, or every enabled service by ascending priority.
    pub fn select(&self, names: &[String]) -> Result<Vec<ServiceConfig>, ConfigError> {
        if names.is_empty() {
            let mut enabled: Vec<_> = self.services.iter().filter(|s| s.enabled).cloned().collect();
            enabled.sort_by_key(|s| s.priority);
            return Ok(enabled);
        }
        names
            .iter()
            .map(|name| {
                self.services
                    .iter()
                    .find(|s| &s.name == name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownService(name.clone()))
            })
            .collect()
    }
}

/// Run-wide overrides shared by every selected service.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub manual_mode: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub force_override: bool,
}

fn env_date(name: &str) -> Result<Option<NaiveDate>> {
    env_nonempty(name)
        .map(|v| {
            NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                .with_context(|| format!("{name} must be YYYY-MM-DD, got {v:?}"))
        })
        .transpose()
}

impl RunRequest {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            manual_mode: env_flag("MANUAL_MODE"),
            start_date: env_date("MANUAL_START_DATE")?,
            end_date: env_date("MANUAL_END_DATE")?,
            force_override: env_flag("FORCE_OVERRIDE"),
        })
    }

    /// Explicit dates win. Manual mode without a start date is a configuration error.
    pub fn range_for(&self, service: &ServiceConfig, today: NaiveDate) -> Result<DateRange, ConfigError> {
        match (self.start_date, self.end_date) {
            (Some(start), end) => DateRange::new(start, end.unwrap_or(start)),
            (None, Some(_)) => Err(ConfigError::Missing("MANUAL_START_DATE".to_string())),
            (None, None) if self.manual_mode => {
                Err(ConfigError::Missing("MANUAL_START_DATE".to_string()))
            }
            (None, None) => Ok(DateRange::offset_from(today, service.date_offset)),
        }
    }

    pub fn options_for(&self, service: &ServiceConfig, today: NaiveDate) -> Result<RunOptions, ConfigError> {
        Ok(RunOptions {
            range: self.range_for(service, today)?,
            manual_mode: self.manual_mode,
            force_override: self.force_override,
        })
    }
}
