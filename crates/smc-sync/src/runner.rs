use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use smc_adapters::search_console::{self, SearchConsoleAdapter, SearchConsoleSettings};
use smc_adapters::topvisor::{self, TopvisorAdapter, TopvisorCredentials};
use smc_adapters::SourceAdapter;
use smc_auth::{OAuthTokenEndpoint, RefreshTokenStore, TokenManager};
use smc_core::{CollectorError, ConfigError, DateRange, RunStats};
use smc_fetch::JsonHttpClient;
use smc_storage::{PersistenceGateway, PgConfig, PgGateway, StorageError};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::notify::{notifier_from_env, NotificationSink};
use crate::runtime::CollectorRuntime;
use crate::{env_nonempty, RunRequest, ServiceConfig, ServiceRegistry, SyncConfig};

/// Builds the adapter for one registry entry.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, service: &ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError> + Send + Sync,
{
    fn build(&self, service: &ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError> {
        self(service)
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env_nonempty(name).ok_or_else(|| ConfigError::Missing(name.to_string()))
}

/// Adapters wired from process environment and registry settings.
pub struct EnvAdapterFactory {
    config: SyncConfig,
    http: JsonHttpClient,
}

impl EnvAdapterFactory {
    pub fn new(config: SyncConfig, http: JsonHttpClient) -> Self {
        Self { config, http }
    }

    fn topvisor(&self, service: &ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError> {
        let settings = service.topvisor.clone().unwrap_or_default();
        let credentials = TopvisorCredentials::from_env()?;
        Ok(Arc::new(TopvisorAdapter::new(
            settings,
            &credentials,
            self.http.clone(),
        )?))
    }

    fn search_console(&self, service: &ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError> {
        let settings = match &service.gsc {
            Some(settings) => settings.clone(),
            None => SearchConsoleSettings::new(&required("GSC_SITE_URL")?),
        };
        let google = &self.config.google;
        let oauth = google.oauth_client()?;
        let client = self.http.client().clone();
        let endpoint = Arc::new(OAuthTokenEndpoint::new(client.clone(), oauth));
        let tokens = TokenManager::new(endpoint, RefreshTokenStore::new(&google.refresh_token_path))
            .with_always_refresh(google.force_refresh);
        let adapter = SearchConsoleAdapter::new(settings, Arc::new(tokens), client)?
            .with_refresh_on_start(google.refresh_on_start);
        Ok(Arc::new(adapter))
    }
}

impl AdapterFactory for EnvAdapterFactory {
    fn build(&self, service: &ServiceConfig) -> Result<Arc<dyn SourceAdapter>, CollectorError> {
        match service.name.as_str() {
            topvisor::SERVICE_NAME => self.topvisor(service),
            search_console::SERVICE_NAME => self.search_console(service),
            other => Err(ConfigError::UnknownService(other.to_string()).into()),
        }
    }
}

#[derive(Debug)]
pub struct ServiceOutcome {
    pub service: String,
    pub range: Option<DateRange>,
    pub result: Result<RunStats, String>,
    pub duration_secs: u64,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ServiceOutcome>,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.service.as_str())
            .collect()
    }

    /// Inserted plus updated across every successful service.
    pub fn total_written(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(RunStats::written)
            .sum()
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.outcomes.len() + 1);
        for outcome in &self.outcomes {
            let range = outcome
                .range
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(match &outcome.result {
                Ok(stats) => format!(
                    "ok     {} [{range}] inserted={} updated={} skipped={} errors={} ({}s)",
                    outcome.service,
                    stats.inserted,
                    stats.updated,
                    stats.skipped,
                    stats.errors,
                    outcome.duration_secs
                ),
                Err(err) => format!("FAILED {} [{range}] {err}", outcome.service),
            });
        }
        lines.push(format!(
            "{} of {} services succeeded, {} records written",
            self.outcomes.len() - self.failed().len(),
            self.outcomes.len(),
            self.total_written()
        ));
        lines.join("\n")
    }
}

/// Runs selected services one after another, each through its own [`CollectorRuntime`].
pub struct ServiceRunner {
    factory: Arc<dyn AdapterFactory>,
    gateway: Arc<dyn PersistenceGateway>,
    notifier: Arc<dyn NotificationSink>,
    schema_dir: Option<PathBuf>,
    pause: Duration,
}

impl ServiceRunner {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        gateway: Arc<dyn PersistenceGateway>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            factory,
            gateway,
            notifier,
            schema_dir: None,
            pause: Duration::from_secs(2),
        }
    }

    pub fn with_schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = Some(dir.into());
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn run(&self, services: &[ServiceConfig], request: &RunRequest, today: NaiveDate) -> RunReport {
        let mut report = RunReport::default();
        for (idx, service) in services.iter().enumerate() {
            let started = Instant::now();
            let (range, result) = self.run_one(service, request, today).await;
            report.outcomes.push(ServiceOutcome {
                service: service.name.clone(),
                range,
                result,
                duration_secs: started.elapsed().as_secs(),
            });
            if idx + 1 < services.len() {
                tokio::time::sleep(self.pause).await;
            }
        }
        info!(
            services = report.outcomes.len(),
            failed = report.failed().len(),
            written = report.total_written(),
            "service runner finished"
        );
        report
    }

    async fn run_one(
        &self,
        service: &ServiceConfig,
        request: &RunRequest,
        today: NaiveDate,
    ) -> (Option<DateRange>, Result<RunStats, String>) {
        let options = match request.options_for(service, today) {
            Ok(options) => options,
            Err(err) => {
                error!(service = %service.name, error = %err, "cannot determine run dates");
                return (None, Err(err.to_string()));
            }
        };
        let range = Some(options.range);
        let adapter = match self.factory.build(service) {
            Ok(adapter) => adapter,
            Err(err) => {
                error!(service = %service.name, error = %err, "cannot construct adapter");
                self.notifier.notify_error(&service.name, &err, 0).await;
                return (range, Err(err.to_string()));
            }
        };
        let mut runtime = CollectorRuntime::new(adapter, self.gateway.clone(), self.notifier.clone());
        if let Some(dir) = &self.schema_dir {
            runtime = runtime.with_schema_dir(dir);
        }
        let result = runtime
            .run(options)
            .await
            .map_err(|failure| failure.error.to_string());
        (range, result)
    }
}

pub async fn run_services(config: &SyncConfig, selection: &[String], request: &RunRequest) -> Result<RunReport> {
    let registry = ServiceRegistry::load(&config.registry_path()).await?;
    let services = registry.select(selection)?;
    let http = JsonHttpClient::new(config.http_config())?;
    let gateway = PgGateway::new(PgConfig::from_env().context("database configuration")?);
    let notifier = notifier_from_env(http.client().clone());
    let factory = EnvAdapterFactory::new(config.clone(), http);

    let runner = ServiceRunner::new(Arc::new(factory), Arc::new(gateway), notifier)
        .with_schema_dir(config.schema_dir())
        .with_pause(config.service_pause);
    Ok(runner.run(&services, request, Local::now().date_naive()).await)
}

/// Connect, `SELECT 1`, disconnect.
pub async fn probe_storage(gateway: &dyn PersistenceGateway) -> Result<(), StorageError> {
    gateway.connect().await?;
    let probe = gateway.execute("SELECT 1", &[]).await;
    if let Err(err) = gateway.disconnect().await {
        warn!(error = %err, "disconnect after probe failed");
    }
    probe.map(|_| ())
}

#[derive(Debug)]
pub struct ServiceCheck {
    pub name: String,
    pub result: Result<(), String>,
}

/// Storage probe followed by each selected adapter's connectivity check.
pub async fn check_services(
    gateway: &dyn PersistenceGateway,
    factory: &dyn AdapterFactory,
    services: &[ServiceConfig],
) -> Vec<ServiceCheck> {
    let mut checks = Vec::with_capacity(services.len() + 1);
    let storage = probe_storage(gateway).await.map_err(|e| e.to_string());
    match &storage {
        Ok(()) => info!("storage reachable"),
        Err(err) => error!(error = %err, "storage unreachable"),
    }
    checks.push(ServiceCheck {
        name: "storage".to_string(),
        result: storage,
    });
    for service in services {
        let result = match factory.build(service) {
            Ok(adapter) => adapter.check_connection().await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            error!(service = %service.name, error = %err, "connection check failed");
        }
        checks.push(ServiceCheck {
            name: service.name.clone(),
            result: result.map_err(|e| e.to_string()),
        });
    }
    checks
}

pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job_config = Arc::new(config.clone());
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            match run_services(&config, &[], &RunRequest::default()).await {
                Ok(report) if report.all_succeeded() => {
                    info!(written = report.total_written(), "scheduled sync finished");
                }
                Ok(report) => warn!(failed = ?report.failed(), "scheduled sync finished with failures"),
                Err(err) => {
                    let reason = format!("{err:#}");
                    error!(error = %reason, "scheduled sync could not start");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
