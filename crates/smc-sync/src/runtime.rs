use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use smc_adapters::{RawRecord, SourceAdapter};
use smc_core::{CollectionRun, CollectorError, ConfigError, NormalizedRecord, RunOptions, RunStats};
use smc_storage::{PersistenceGateway, ReconciliationEngine, StorageError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::notify::NotificationSink;

pub const DEFAULT_PROGRESS_EVERY: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Connected,
    SchemaReady,
    ConnectivityChecked,
    Fetching,
    Reconciling,
    Completed,
    Failed,
}

/// A run-fatal error together with the statistics gathered before it.
#[derive(Debug, Error)]
#[error("{service} run failed: {error}")]
pub struct RunFailure {
    pub service: String,
    #[source]
    pub error: CollectorError,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveOutcome {
    Inserted,
    Updated,
    Skipped,
}

/// Drives one adapter through connect, schema, connectivity check, fetch and reconcile.
pub struct CollectorRuntime {
    adapter: Arc<dyn SourceAdapter>,
    gateway: Arc<dyn PersistenceGateway>,
    notifier: Arc<dyn NotificationSink>,
    schema_dir: Option<PathBuf>,
    progress_every: u64,
    transitions: Vec<RunState>,
}

impl CollectorRuntime {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        gateway: Arc<dyn PersistenceGateway>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            adapter,
            gateway,
            notifier,
            schema_dir: None,
            progress_every: DEFAULT_PROGRESS_EVERY,
            transitions: vec![RunState::Idle],
        }
    }

    /// Directory holding `<service>.sql` bootstrap scripts.
    pub fn with_schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = Some(dir.into());
        self
    }

    pub fn with_progress_every(mut self, every: u64) -> Self {
        self.progress_every = every.max(1);
        self
    }

    pub fn state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    fn enter(&mut self, state: RunState) {
        debug!(from = ?self.state(), to = ?state, "run state");
        self.transitions.push(state);
    }

    pub async fn run(&mut self, options: RunOptions) -> Result<RunStats, RunFailure> {
        let mut run = CollectionRun::start(self.adapter.service_name(), options);
        let span = info_span!(
            "collector_run",
            run_id = %run.run_id,
            service = %run.service_name,
            range = %run.options.range
        );
        self.run_in_span(&mut run).instrument(span).await
    }

    async fn run_in_span(&mut self, run: &mut CollectionRun) -> Result<RunStats, RunFailure> {
        info!(
            manual_mode = run.options.manual_mode,
            force_override = run.options.force_override,
            "collector run starting"
        );
        let outcome = self.drive(run).await;

        // teardown runs on every exit path
        if let Err(err) = self.gateway.disconnect().await {
            warn!(error = %err, "disconnect failed");
        }

        let duration = run.elapsed_secs();
        match outcome {
            Ok(()) => {
                self.enter(RunState::Completed);
                let stats = &run.stats;
                info!(
                    processed = stats.processed,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    skipped = stats.skipped,
                    errors = stats.errors,
                    warnings = stats.warnings.len(),
                    duration_secs = duration,
                    "collector run completed"
                );
                if stats.warnings.is_empty() {
                    self.notifier
                        .notify_success(&run.service_name, stats, duration)
                        .await;
                } else {
                    self.notifier
                        .notify_warning(&run.service_name, stats, duration)
                        .await;
                }
                Ok(run.stats.clone())
            }
            Err(error) => {
                self.enter(RunState::Failed);
                run.stats.errors += 1;
                error!(error = %error, fatal = error.is_fatal(), duration_secs = duration, "collector run failed");
                self.notifier
                    .notify_error(&run.service_name, &error, duration)
                    .await;
                Err(RunFailure {
                    service: run.service_name.clone(),
                    error,
                    stats: run.stats.clone(),
                })
            }
        }
    }

    async fn drive(&mut self, run: &mut CollectionRun) -> Result<(), CollectorError> {
        self.enter(RunState::Starting);
        self.notifier.notify_start(&run.service_name).await;
        self.adapter.prepare().await?;

        self.gateway.connect().await?;
        self.enter(RunState::Connected);

        self.apply_schema().await?;
        self.enter(RunState::SchemaReady);

        self.adapter.check_connection().await?;
        self.enter(RunState::ConnectivityChecked);

        self.enter(RunState::Fetching);
        let fetched = self.adapter.fetch(&run.options.range).await?;
        let failures = fetched.failures.len() as u64;
        run.stats.fetch_failures += failures;
        run.stats.errors += failures;
        if fetched.records.is_empty() {
            warn!(range = %run.options.range, "no records fetched");
            run.stats
                .warn(format!("no records fetched for {}", run.options.range));
        } else {
            info!(records = fetched.records.len(), failed_requests = failures, "fetch complete");
        }

        self.enter(RunState::Reconciling);
        self.reconcile(run, &fetched.records).await;
        Ok(())
    }

    async fn apply_schema(&self) -> Result<(), CollectorError> {
        let Some(dir) = &self.schema_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.sql", self.adapter.service_name()));
        let script = match tokio::fs::read_to_string(&path).await {
            Ok(script) => script,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no schema script");
                return Ok(());
            }
            Err(err) => {
                return Err(ConfigError::Invalid {
                    name: path.display().to_string(),
                    reason: err.to_string(),
                }
                .into())
            }
        };
        self.gateway.apply_schema(&script).await?;
        info!(path = %path.display(), "schema applied");
        Ok(())
    }

    async fn reconcile(&self, run: &mut CollectionRun, records: &[RawRecord]) {
        let mut reconciler = ReconciliationEngine::new(self.gateway.clone());
        let mut seen = HashSet::new();
        let force = run.options.force_override;
        let stats = &mut run.stats;

        for raw in records {
            let record = match self.adapter.validate(raw, &mut reconciler).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    stats.errors += 1;
                    debug!(record = %raw, "dropping malformed row");
                    continue;
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(error = %err, record = %raw, "record rejected");
                    continue;
                }
            };

            let key = self.adapter.business_key(&record);
            if seen.contains(&key) {
                stats.skipped += 1;
                warn!(key = %key, "business key already handled in this run, skipping");
                continue;
            }

            let outcome = self.save(&record, force).await;
            if outcome.is_ok() {
                seen.insert(key.clone());
            }
            match outcome {
                Ok(SaveOutcome::Inserted) => {
                    stats.inserted += 1;
                    stats.processed += 1;
                }
                Ok(SaveOutcome::Updated) => {
                    stats.updated += 1;
                    stats.processed += 1;
                }
                Ok(SaveOutcome::Skipped) => {
                    stats.skipped += 1;
                    debug!(key = %key, "record exists, skipping");
                    continue;
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(key = %key, record = %record.to_json(), error = %err, "failed to save record");
                    continue;
                }
            }

            if stats.processed % self.progress_every == 0 {
                info!(processed = stats.processed, total = records.len(), "reconcile progress");
            }
        }

        let counters = reconciler.stats();
        debug!(
            dimension_cache_hits = counters.dimension_cache_hits,
            dimension_inserts = counters.dimension_inserts,
            content_inserts = counters.content_inserts,
            content_sentinels = counters.content_sentinels,
            "reconciliation counters"
        );
    }

    async fn save(&self, record: &NormalizedRecord, force: bool) -> Result<SaveOutcome, StorageError> {
        let gateway = self.gateway.as_ref();
        if !self.adapter.exists(gateway, record).await? {
            self.adapter.insert(gateway, record).await?;
            return Ok(SaveOutcome::Inserted);
        }
        if force {
            self.adapter.update(gateway, record).await?;
            return Ok(SaveOutcome::Updated);
        }
        Ok(SaveOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{json, Value as JsonValue};
    use smc_adapters::Fetched;
    use smc_core::{DateRange, RecordError, Scalar};
    use smc_storage::{MemoryGateway, TableSpec};
    use std::sync::Mutex;

    /// Serves canned rows of `{"key": .., "value": ..}`.
    struct StaticAdapter {
        table: TableSpec,
        records: Vec<JsonValue>,
        failures: Vec<String>,
        reachable: bool,
        fetch_calls: Mutex<u32>,
    }

    impl StaticAdapter {
        fn new(records: Vec<JsonValue>) -> Self {
            Self {
                table: TableSpec::new("test.values", &["key"], &["value"]),
                records,
                failures: Vec::new(),
                reachable: true,
                fetch_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn service_name(&self) -> &str {
            "static"
        }

        fn table(&self) -> &TableSpec {
            &self.table
        }

        async fn check_connection(&self) -> Result<(), CollectorError> {
            if self.reachable {
                Ok(())
            } else {
                Err(CollectorError::Connectivity("unreachable".into()))
            }
        }

        async fn fetch(&self, _range: &DateRange) -> Result<Fetched, CollectorError> {
            *self.fetch_calls.lock().unwrap() += 1;
            Ok(Fetched {
                records: self.records.clone(),
                failures: self.failures.clone(),
            })
        }

        async fn validate(
            &self,
            raw: &RawRecord,
            _reconciler: &mut ReconciliationEngine,
        ) -> Result<Option<NormalizedRecord>, RecordError> {
            let Some(object) = raw.as_object() else {
                return Ok(None);
            };
            let key = object
                .get("key")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| RecordError::Invalid("missing key".into()))?;
            let value = object.get("value").and_then(Scalar::from_json).unwrap_or(Scalar::Null);
            Ok(Some(NormalizedRecord::new().with("key", key).with("value", value)))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn notify_start(&self, service: &str) {
            self.events.lock().unwrap().push(format!("start {service}"));
        }

        async fn notify_success(&self, service: &str, _stats: &RunStats, _duration_secs: u64) {
            self.events.lock().unwrap().push(format!("success {service}"));
        }

        async fn notify_warning(&self, service: &str, stats: &RunStats, _duration_secs: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("warning {service} {}", stats.warnings.len()));
        }

        async fn notify_error(&self, service: &str, _error: &CollectorError, _duration_secs: u64) {
            self.events.lock().unwrap().push(format!("error {service}"));
        }
    }

    fn options(force_override: bool) -> RunOptions {
        RunOptions {
            range: DateRange::single(NaiveDate::from_ymd_opt(2025, 9, 15).unwrap()),
            manual_mode: false,
            force_override,
        }
    }

    fn runtime(
        adapter: StaticAdapter,
        gateway: &Arc<MemoryGateway>,
        notifier: &Arc<RecordingNotifier>,
    ) -> CollectorRuntime {
        CollectorRuntime::new(Arc::new(adapter), gateway.clone(), notifier.clone())
    }

    fn rows() -> Vec<JsonValue> {
        vec![
            json!({"key": "a", "value": 1}),
            json!({"key": "b", "value": 2}),
        ]
    }

    #[tokio::test]
    async fn walks_every_state_and_disconnects() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime(StaticAdapter::new(rows()), &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();

        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.processed, 2);
        assert_eq!(
            rt.transitions(),
            &[
                RunState::Idle,
                RunState::Starting,
                RunState::Connected,
                RunState::SchemaReady,
                RunState::ConnectivityChecked,
                RunState::Fetching,
                RunState::Reconciling,
                RunState::Completed,
            ]
        );
        assert!(!gateway.is_connected());
        assert_eq!(gateway.disconnect_calls(), 1);
        assert_eq!(notifier.events(), vec!["start static", "success static"]);
    }

    #[tokio::test]
    async fn connect_failure_still_tears_down_and_notifies() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_connect("connection refused");
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime(StaticAdapter::new(rows()), &gateway, &notifier);

        let failure = rt.run(options(false)).await.unwrap_err();
        assert!(matches!(failure.error, CollectorError::Persistence(_)));
        assert_eq!(failure.stats.errors, 1);
        assert_eq!(rt.state(), RunState::Failed);
        assert_eq!(gateway.disconnect_calls(), 1);
        assert_eq!(notifier.events(), vec!["start static", "error static"]);
    }

    #[tokio::test]
    async fn unreachable_api_fails_before_fetch() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut adapter = StaticAdapter::new(rows());
        adapter.reachable = false;
        let adapter = Arc::new(adapter);
        let mut rt = CollectorRuntime::new(adapter.clone(), gateway.clone(), notifier.clone());

        let failure = rt.run(options(false)).await.unwrap_err();
        assert!(matches!(failure.error, CollectorError::Connectivity(_)));
        assert_eq!(*adapter.fetch_calls.lock().unwrap(), 0);
        assert!(!gateway.is_connected());
        assert!(gateway.rows("test.values").is_empty());
    }

    #[tokio::test]
    async fn empty_fetch_completes_with_warning() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime(StaticAdapter::new(Vec::new()), &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();
        assert_eq!(stats.warnings.len(), 1);
        assert_eq!(stats.processed, 0);
        assert_eq!(notifier.events(), vec!["start static", "warning static 1"]);
    }

    #[tokio::test]
    async fn malformed_rows_are_counted_and_skipped() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let records = vec![
            JsonValue::Null,
            json!("text"),
            json!({"value": 3}),
            json!({"key": "a", "value": 1}),
        ];
        let mut rt = runtime(StaticAdapter::new(records), &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn rerun_skips_existing_and_force_updates() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let first = runtime(StaticAdapter::new(rows()), &gateway, &notifier)
            .run(options(false))
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);

        let second = runtime(StaticAdapter::new(rows()), &gateway, &notifier)
            .run(options(false))
            .await
            .unwrap();
        assert_eq!((second.inserted, second.updated, second.processed), (0, 0, 0));
        assert_eq!(second.skipped, 2);

        let changed = vec![json!({"key": "a", "value": 10})];
        let forced = runtime(StaticAdapter::new(changed), &gateway, &notifier)
            .run(options(true))
            .await
            .unwrap();
        assert_eq!((forced.inserted, forced.updated, forced.processed), (0, 1, 1));

        let stored = gateway.rows("test.values");
        assert_eq!(stored.len(), 2);
        let a = stored
            .iter()
            .find(|r| r.get("key") == Some(&Scalar::from("a")))
            .unwrap();
        assert_eq!(a.get("value"), Some(&Scalar::Int(10)));
    }

    #[tokio::test]
    async fn failed_write_does_not_abort_run() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_writes_where("key", "a");
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime(StaticAdapter::new(rows()), &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(rt.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn duplicate_key_in_one_run_inserts_once() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let records = vec![
            json!({"key": "a", "value": 1}),
            json!({"key": "a", "value": 2}),
        ];
        let mut rt = runtime(StaticAdapter::new(records), &gateway, &notifier);
        let stats = rt.run(options(true)).await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(gateway.rows("test.values").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_is_retried_after_failed_write() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next_writes(1);
        let notifier = Arc::new(RecordingNotifier::default());
        let records = vec![
            json!({"key": "a", "value": 1}),
            json!({"key": "a", "value": 2}),
            json!({"key": "a", "value": 3}),
        ];
        let mut rt = runtime(StaticAdapter::new(records), &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();
        assert_eq!((stats.errors, stats.inserted, stats.skipped), (1, 1, 1));
        let rows = gateway.rows("test.values");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("value"), Some(&Scalar::Int(2)));
    }

    #[tokio::test]
    async fn request_failures_count_as_errors() {
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut adapter = StaticAdapter::new(rows());
        adapter.failures = vec!["request 2: http 500".into()];
        let mut rt = runtime(adapter, &gateway, &notifier);
        let stats = rt.run(options(false)).await.unwrap();
        assert_eq!(stats.fetch_failures, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.inserted, 2);
    }

    #[tokio::test]
    async fn schema_script_is_applied_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("static.sql"), "CREATE SCHEMA IF NOT EXISTS test;").unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut rt = runtime(StaticAdapter::new(rows()), &gateway, &notifier).with_schema_dir(dir.path());
        rt.run(options(false)).await.unwrap();
        assert_eq!(gateway.applied_schemas(), vec!["CREATE SCHEMA IF NOT EXISTS test;".to_string()]);

        let empty = tempfile::tempdir().unwrap();
        let other = Arc::new(MemoryGateway::new());
        runtime(StaticAdapter::new(rows()), &other, &notifier)
            .with_schema_dir(empty.path())
            .run(options(false))
            .await
            .unwrap();
        assert!(other.applied_schemas().is_empty());
    }
}
