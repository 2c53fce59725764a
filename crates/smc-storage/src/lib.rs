//! Persistence gateway and the reconciliation engine that maps external keys to surrogate ids.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use smc_core::{CollectorError, NormalizedRecord, RecordError, Scalar};
use thiserror::Error;

mod memory;
mod postgres;
mod reconcile;
pub mod sql;

pub use memory::{ContentRow, DimensionRow, MemoryGateway};
pub use postgres::{PgConfig, PgGateway};
pub use reconcile::{content_digest, ReconciliationEngine, ReconciliationStats, EMPTY_CONTENT_ID};

pub const CRATE_NAME: &str = "smc-storage";

/// One result row keyed by column name.
pub type Row = BTreeMap<String, Scalar>;

/// Output table a collector writes normalized records into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub table: String,
    pub key_columns: Vec<String>,
    pub value_columns: Vec<String>,
    /// Set to `CURRENT_TIMESTAMP` on every update when present.
    pub touch_column: Option<String>,
}

impl TableSpec {
    pub fn new(table: &str, key_columns: &[&str], value_columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            value_columns: value_columns.iter().map(|c| c.to_string()).collect(),
            touch_column: None,
        }
    }

    pub fn with_touch_column(mut self, column: &str) -> Self {
        self.touch_column = Some(column.to_string());
        self
    }

    pub fn business_key(&self, record: &NormalizedRecord) -> String {
        record.key_for(&self.key_columns)
    }
}

/// Lookup table whose rows are created on first sight of an external key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionSpec {
    pub name: String,
    pub table: String,
    pub key_columns: Vec<String>,
    pub label_columns: Vec<String>,
    /// When set, only these keys (as key fragments) may be resolved; anything else is unmapped.
    pub allowed: Option<BTreeSet<Vec<String>>>,
}

impl DimensionSpec {
    pub fn new(name: &str, table: &str, key_columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            label_columns: Vec::new(),
            allowed: None,
        }
    }

    pub fn with_labels(mut self, label_columns: &[&str]) -> Self {
        self.label_columns = label_columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_allowed<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        self.allowed = Some(keys.into_iter().collect());
        self
    }

    pub fn allows(&self, key: &[Scalar]) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.contains(&key_fragments(key)),
            None => true,
        }
    }
}

pub fn key_fragments(key: &[Scalar]) -> Vec<String> {
    key.iter().map(Scalar::key_fragment).collect()
}

/// Content-addressed table deduplicating long text by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSpec {
    pub table: String,
}

impl ContentSpec {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not connected")]
    NotConnected,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record for {table} is missing key column {column}")]
    MissingColumn { table: String, column: String },
    #[error("invalid table spec: {0}")]
    InvalidSpec(String),
    #[error("duplicate key {key} in {table}")]
    Conflict { table: String, key: String },
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Injected(String),
}

impl From<StorageError> for CollectorError {
    fn from(err: StorageError) -> Self {
        CollectorError::Persistence(err.to_string())
    }
}

impl From<StorageError> for RecordError {
    fn from(err: StorageError) -> Self {
        RecordError::Persistence(err.to_string())
    }
}

/// Storage operations a collector run needs. Implementations own their connection lifecycle.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;

    /// Idempotent; safe to call after a failed connect.
    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Runs a multi-statement DDL script.
    async fn apply_schema(&self, script: &str) -> Result<(), StorageError>;

    async fn execute(&self, statement: &str, params: &[Scalar]) -> Result<Vec<Row>, StorageError>;

    async fn record_exists(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<bool, StorageError>;

    async fn insert_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError>;

    /// Returns the number of rows updated.
    async fn update_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<u64, StorageError>;

    async fn find_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
    ) -> Result<Option<i64>, StorageError>;

    /// Inserts the key or returns the id of the row another writer created first.
    async fn upsert_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
        labels: &[Scalar],
    ) -> Result<i64, StorageError>;

    /// Increments the usage counter of an existing digest.
    async fn bump_content(&self, spec: &ContentSpec, digest: &str)
        -> Result<Option<i64>, StorageError>;

    /// Inserts the content with a usage of one, or increments the existing row.
    async fn upsert_content(
        &self,
        spec: &ContentSpec,
        digest: &str,
        content: &str,
    ) -> Result<i64, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_set_restricts_dimension_keys() {
        let spec = DimensionSpec::new("project region", "topvisor.project_regions", &["project_id", "region_index"])
            .with_allowed(vec![vec!["11430357".to_string(), "5".to_string()]]);
        assert!(spec.allows(&[Scalar::Int(11430357), Scalar::Int(5)]));
        assert!(!spec.allows(&[Scalar::Int(11430357), Scalar::Int(7)]));
        assert!(DimensionSpec::new("site", "common.site_map", &["url"]).allows(&[Scalar::from("/x")]));
    }

    #[test]
    fn storage_errors_surface_as_persistence_failures() {
        let err: CollectorError = StorageError::NotConnected.into();
        assert!(matches!(err, CollectorError::Persistence(_)));
        let err: RecordError = StorageError::Injected("boom".into()).into();
        assert_eq!(err.to_string(), "persistence failed: boom");
    }
}
