use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use smc_core::{RecordError, Scalar};
use tracing::debug;

use crate::{key_fragments, ContentSpec, DimensionSpec, PersistenceGateway};

/// Id recorded for empty or whitespace-only content. No content row ever carries it.
pub const EMPTY_CONTENT_ID: i64 = 0;

pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationStats {
    pub dimension_cache_hits: u64,
    pub dimension_storage_hits: u64,
    pub dimension_inserts: u64,
    pub content_storage_hits: u64,
    pub content_inserts: u64,
    pub content_sentinels: u64,
    pub contents_hashed: u64,
}

/// Resolves external keys and free text to surrogate ids for one run.
///
/// The dimension cache lives only as long as the engine, so every run starts cold and storage
/// stays the source of truth. Content is not cached: each occurrence bumps its usage counter in
/// storage and that statement already returns the id. Concurrent engines converge on one row per
/// key through the gateway's upserts.
pub struct ReconciliationEngine {
    gateway: Arc<dyn PersistenceGateway>,
    dimensions: HashMap<String, HashMap<Vec<String>, i64>>,
    stats: ReconciliationStats,
}

impl ReconciliationEngine {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            gateway,
            dimensions: HashMap::new(),
            stats: ReconciliationStats::default(),
        }
    }

    pub fn stats(&self) -> ReconciliationStats {
        self.stats
    }

    pub async fn resolve_dimension(
        &mut self,
        spec: &DimensionSpec,
        key: &[Scalar],
        labels: &[Scalar],
    ) -> Result<i64, RecordError> {
        if key.len() != spec.key_columns.len() {
            return Err(RecordError::Invalid(format!(
                "{} key needs {} parts, got {}",
                spec.name,
                spec.key_columns.len(),
                key.len()
            )));
        }
        if let Some((column, _)) = spec.key_columns.iter().zip(key).find(|(_, v)| v.is_null()) {
            return Err(RecordError::Invalid(format!(
                "{} key part {column} is empty",
                spec.name
            )));
        }
        let fragments = key_fragments(key);
        if !spec.allows(key) {
            return Err(RecordError::UnmappedDimension {
                dimension: spec.name.clone(),
                key: fragments.join(":"),
            });
        }

        if let Some(id) = self
            .dimensions
            .get(&spec.table)
            .and_then(|cache| cache.get(&fragments))
        {
            self.stats.dimension_cache_hits += 1;
            return Ok(*id);
        }

        let id = match self.gateway.find_dimension(spec, key).await? {
            Some(id) => {
                self.stats.dimension_storage_hits += 1;
                id
            }
            None => {
                let id = self.gateway.upsert_dimension(spec, key, labels).await?;
                self.stats.dimension_inserts += 1;
                debug!(dimension = %spec.name, key = %fragments.join(":"), id, "dimension row created");
                id
            }
        };
        self.dimensions
            .entry(spec.table.clone())
            .or_default()
            .insert(fragments, id);
        Ok(id)
    }

    /// Every non-empty occurrence counts one usage against the stored content.
    pub async fn resolve_content(
        &mut self,
        spec: &ContentSpec,
        text: &str,
    ) -> Result<i64, RecordError> {
        if text.trim().is_empty() {
            self.stats.content_sentinels += 1;
            return Ok(EMPTY_CONTENT_ID);
        }
        let digest = content_digest(text);
        self.stats.contents_hashed += 1;

        match self.gateway.bump_content(spec, &digest).await? {
            Some(id) => {
                self.stats.content_storage_hits += 1;
                Ok(id)
            }
            None => {
                self.stats.content_inserts += 1;
                Ok(self.gateway.upsert_content(spec, &digest, text).await?)
            }
        }
    }
}
