use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use smc_core::{NormalizedRecord, Scalar};

use crate::{key_fragments, ContentSpec, DimensionSpec, PersistenceGateway, Row, StorageError, TableSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRow {
    pub id: i64,
    pub key: Vec<String>,
    pub labels: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRow {
    pub id: i64,
    pub digest: String,
    pub content: String,
    pub usage_count: i64,
}

#[derive(Debug)]
struct MemoryState {
    connected: bool,
    connect_calls: u32,
    disconnect_calls: u32,
    connect_failure: Option<String>,
    write_failures: Vec<(String, Scalar)>,
    pending_write_failures: u32,
    schemas: Vec<String>,
    tables: HashMap<String, Vec<NormalizedRecord>>,
    dimensions: HashMap<String, Vec<DimensionRow>>,
    contents: HashMap<String, Vec<ContentRow>>,
    next_id: i64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            connected: false,
            connect_calls: 0,
            disconnect_calls: 0,
            connect_failure: None,
            write_failures: Vec::new(),
            pending_write_failures: 0,
            schemas: Vec::new(),
            tables: HashMap::new(),
            dimensions: HashMap::new(),
            contents: HashMap::new(),
            // 0 is reserved for the empty-content sentinel
            next_id: 1,
        }
    }
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_write(&mut self, record: &NormalizedRecord) -> Result<(), StorageError> {
        if self.pending_write_failures > 0 {
            self.pending_write_failures -= 1;
            return Err(StorageError::Injected("write rejected".to_string()));
        }
        for (field, value) in &self.write_failures {
            if record.get(field) == Some(value) {
                return Err(StorageError::Injected(format!(
                    "write rejected for {field}={}",
                    value.key_fragment()
                )));
            }
        }
        Ok(())
    }
}

fn key_matches(spec: &TableSpec, stored: &NormalizedRecord, record: &NormalizedRecord) -> bool {
    spec.key_columns
        .iter()
        .all(|column| stored.get(column) == record.get(column))
}

fn require_keys(spec: &TableSpec, record: &NormalizedRecord) -> Result<(), StorageError> {
    match spec.key_columns.iter().find(|c| record.get(c).is_none()) {
        Some(column) => Err(StorageError::MissingColumn {
            table: spec.table.clone(),
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

/// In-process gateway with the same contract as [`crate::PgGateway`], used by tests and dry runs.
///
/// Lookups that precede an insert yield after releasing the lock, so concurrent callers
/// interleave between the lookup and the write.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connected(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let state = self.lock();
        if state.connected {
            Ok(state)
        } else {
            Err(StorageError::NotConnected)
        }
    }

    pub fn fail_connect(&self, message: &str) {
        self.lock().connect_failure = Some(message.to_string());
    }

    /// Inserts and updates of records whose `field` equals `value` fail.
    pub fn fail_writes_where(&self, field: &str, value: impl Into<Scalar>) {
        self.lock()
            .write_failures
            .push((field.to_string(), value.into()));
    }

    /// The next `count` inserts or updates fail regardless of their content.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().pending_write_failures = count;
    }

    pub fn seed_record(&self, table: &str, record: NormalizedRecord) {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    pub fn rows(&self, table: &str) -> Vec<NormalizedRecord> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn dimension_rows(&self, table: &str) -> Vec<DimensionRow> {
        self.lock().dimensions.get(table).cloned().unwrap_or_default()
    }

    pub fn content_rows(&self, table: &str) -> Vec<ContentRow> {
        self.lock().contents.get(table).cloned().unwrap_or_default()
    }

    pub fn applied_schemas(&self) -> Vec<String> {
        self.lock().schemas.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.lock().disconnect_calls
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn connect(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.connect_calls += 1;
        if let Some(message) = &state.connect_failure {
            return Err(StorageError::Injected(message.clone()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        state.connected = false;
        Ok(())
    }

    async fn apply_schema(&self, script: &str) -> Result<(), StorageError> {
        self.connected()?.schemas.push(script.to_string());
        Ok(())
    }

    async fn execute(&self, statement: &str, _params: &[Scalar]) -> Result<Vec<Row>, StorageError> {
        let _state = self.connected()?;
        if statement.trim().eq_ignore_ascii_case("select 1") {
            let mut row = Row::new();
            row.insert("?column?".to_string(), Scalar::Int(1));
            return Ok(vec![row]);
        }
        Err(StorageError::Unsupported(statement.to_string()))
    }

    async fn record_exists(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<bool, StorageError> {
        require_keys(spec, record)?;
        let state = self.connected()?;
        Ok(state
            .tables
            .get(&spec.table)
            .is_some_and(|rows| rows.iter().any(|stored| key_matches(spec, stored, record))))
    }

    async fn insert_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError> {
        require_keys(spec, record)?;
        let mut state = self.connected()?;
        state.check_write(record)?;
        let rows = state.tables.entry(spec.table.clone()).or_default();
        if rows.iter().any(|stored| key_matches(spec, stored, record)) {
            return Err(StorageError::Conflict {
                table: spec.table.clone(),
                key: spec.business_key(record),
            });
        }
        let mut stored = NormalizedRecord::new();
        for column in spec.key_columns.iter().chain(spec.value_columns.iter()) {
            if let Some(value) = record.get(column) {
                stored.insert(column.clone(), value.clone());
            }
        }
        rows.push(stored);
        Ok(())
    }

    async fn update_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<u64, StorageError> {
        require_keys(spec, record)?;
        let mut state = self.connected()?;
        state.check_write(record)?;
        let mut updated = 0;
        if let Some(rows) = state.tables.get_mut(&spec.table) {
            for stored in rows.iter_mut().filter(|stored| key_matches(spec, stored, record)) {
                for column in &spec.value_columns {
                    if let Some(value) = record.get(column) {
                        stored.insert(column.clone(), value.clone());
                    }
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn find_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
    ) -> Result<Option<i64>, StorageError> {
        let key = key_fragments(key);
        let found = self
            .connected()?
            .dimensions
            .get(&spec.table)
            .and_then(|rows| rows.iter().find(|row| row.key == key))
            .map(|row| row.id);
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn upsert_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
        labels: &[Scalar],
    ) -> Result<i64, StorageError> {
        if key.len() != spec.key_columns.len() {
            return Err(StorageError::InvalidSpec(format!(
                "{} expects {} key values, got {}",
                spec.table,
                spec.key_columns.len(),
                key.len()
            )));
        }
        if key.iter().any(Scalar::is_null) {
            return Err(StorageError::InvalidSpec(format!("{} key has a null part", spec.table)));
        }
        let mut state = self.connected()?;
        let key = key_fragments(key);
        let id = state.allocate_id();
        let rows = state.dimensions.entry(spec.table.clone()).or_default();
        if let Some(existing) = rows.iter_mut().find(|row| row.key == key) {
            if !labels.is_empty() {
                existing.labels = labels.to_vec();
            }
            return Ok(existing.id);
        }
        rows.push(DimensionRow {
            id,
            key,
            labels: labels.to_vec(),
        });
        Ok(id)
    }

    async fn bump_content(
        &self,
        spec: &ContentSpec,
        digest: &str,
    ) -> Result<Option<i64>, StorageError> {
        let bumped = self
            .connected()?
            .contents
            .get_mut(&spec.table)
            .and_then(|rows| rows.iter_mut().find(|row| row.digest == digest))
            .map(|row| {
                row.usage_count += 1;
                row.id
            });
        tokio::task::yield_now().await;
        Ok(bumped)
    }

    async fn upsert_content(
        &self,
        spec: &ContentSpec,
        digest: &str,
        content: &str,
    ) -> Result<i64, StorageError> {
        let mut state = self.connected()?;
        let id = state.allocate_id();
        let rows = state.contents.entry(spec.table.clone()).or_default();
        if let Some(existing) = rows.iter_mut().find(|row| row.digest == digest) {
            existing.usage_count += 1;
            return Ok(existing.id);
        }
        rows.push(ContentRow {
            id,
            digest: digest.to_string(),
            content: content.to_string(),
            usage_count: 1,
        });
        Ok(id)
    }
}
