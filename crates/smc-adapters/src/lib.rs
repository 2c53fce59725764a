//! Source adapter contract plus the rank-tracker and search-console integrations.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value as JsonValue;
use smc_core::{CollectorError, ConfigError, DateRange, NormalizedRecord, RecordError};
use smc_storage::{PersistenceGateway, ReconciliationEngine, StorageError, TableSpec};

pub mod search_console;
pub mod topvisor;

pub use search_console::{SearchConsoleAdapter, SearchConsoleSettings};
pub use topvisor::{TopvisorAdapter, TopvisorCredentials, TopvisorRequestSpec, TopvisorSettings};

pub const CRATE_NAME: &str = "smc-adapters";

/// Row as delivered by a provider, before validation.
pub type RawRecord = JsonValue;

/// Result of an adapter's fetch phase. Failed requests do not abort the fetch.
#[derive(Debug, Default)]
pub struct Fetched {
    pub records: Vec<RawRecord>,
    /// One entry per request that exhausted its retries.
    pub failures: Vec<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn service_name(&self) -> &str;

    /// Output table, business key included.
    fn table(&self) -> &TableSpec;

    /// Runs before storage is touched; credential checks belong here.
    async fn prepare(&self) -> Result<(), CollectorError> {
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), CollectorError>;

    async fn fetch(&self, range: &DateRange) -> Result<Fetched, CollectorError>;

    /// `Ok(None)` marks a structurally invalid row; `Err` a row that could not be reconciled.
    async fn validate(
        &self,
        raw: &RawRecord,
        reconciler: &mut ReconciliationEngine,
    ) -> Result<Option<NormalizedRecord>, RecordError>;

    fn business_key(&self, record: &NormalizedRecord) -> String {
        self.table().business_key(record)
    }

    async fn exists(
        &self,
        gateway: &dyn PersistenceGateway,
        record: &NormalizedRecord,
    ) -> Result<bool, StorageError> {
        gateway.record_exists(self.table(), record).await
    }

    async fn insert(
        &self,
        gateway: &dyn PersistenceGateway,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError> {
        gateway.insert_record(self.table(), record).await
    }

    async fn update(
        &self,
        gateway: &dyn PersistenceGateway,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError> {
        gateway.update_record(self.table(), record).await.map(|_| ())
    }
}

pub(crate) fn required_env(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name.to_string())),
    }
}

pub(crate) fn secret_env(name: &str) -> Result<SecretString, ConfigError> {
    required_env(name).map(SecretString::from)
}
