//! # Bloom Index Layer
//!
//! Approximate search over raw result rows, one filter set per
//! (tenant, dataset type) key.
//!
//! Two implementations share the [`FilterIndex`] contract:
//! - [`BloomManager`]: process memory only
//! - [`PersistentBloomIndex`]: one tenant, filters serialized under
//!   `<data_dir>/<tenant>/bloom/` and loaded lazily
//!
//! A rebuild constructs a complete new [`BloomIndex`] outside any lock and
//! swaps the `Arc` in under the write lock. Readers hold their own `Arc`, so
//! they see the old index or the new one, never a mix.

pub mod filter;
pub mod index;
pub mod manager;
pub mod persistent;
pub mod tokenize;

pub use filter::BloomFilter;
pub use index::BloomIndex;
pub use manager::BloomManager;
pub use persistent::PersistentBloomIndex;

use crate::results::{ResultHook, StoredResult};
use crate::{Row, TenantId, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// TYPES
// =============================================================================

/// Key of one filter set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterKey {
    pub tenant: TenantId,
    pub dataset: String,
}

impl FilterKey {
    pub fn new(tenant: &TenantId, dataset: &str) -> Result<Self, VaultError> {
        if dataset.trim().is_empty() {
            return Err(VaultError::InvalidArgument(
                "dataset type must not be empty".to_string(),
            ));
        }
        Ok(Self {
            tenant: tenant.clone(),
            dataset: dataset.to_string(),
        })
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.dataset)
    }
}

/// Descriptive record of one built filter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterMetadata {
    /// Rows indexed.
    pub item_count: usize,
    /// Distinct tokens inserted into the global filter.
    pub token_count: usize,
    /// Bit-array bytes across the global and chunk filters.
    pub memory_bytes: usize,
    /// Configured target rate.
    pub false_positive_rate: f64,
    /// Expected rate of the global filter at its actual fill.
    pub estimated_false_positive_rate: f64,
    pub chunk_count: usize,
    pub chunk_size: usize,
    pub updated_at: u64,
}

/// Result of a filter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub matched_count: usize,
    pub matched_items: Vec<Row>,
    pub search_time_micros: u64,
    pub filter_stats: FilterMetadata,
    /// True when no candidate rows were supplied and the count is an upper bound.
    pub approximate: bool,
    pub chunks_scanned: usize,
    pub chunks_skipped: usize,
}

// =============================================================================
// CONTRACT
// =============================================================================

/// Build and search contract shared by the in-memory and persistent indices.
pub trait FilterIndex: Send + Sync {
    /// Build a filter set over `rows`, replacing any prior one for the key.
    ///
    /// On error the previous filter set stays in place.
    fn build_filter(
        &self,
        tenant: &TenantId,
        dataset: &str,
        rows: &[Row],
        chunk_size: usize,
    ) -> Result<FilterMetadata, VaultError>;

    /// Search with AND semantics across terms. See [`BloomIndex::search`].
    fn search(
        &self,
        tenant: &TenantId,
        dataset: &str,
        terms: &[String],
        candidates: Option<&[Row]>,
    ) -> Result<SearchOutcome, VaultError>;

    fn is_filter_available(&self, tenant: &TenantId, dataset: &str) -> bool;

    /// Metadata of every filter set, keyed by `tenant/dataset`.
    fn filter_stats(&self) -> BTreeMap<String, FilterMetadata>;

    /// Total bit-array bytes across all filter sets.
    fn memory_usage(&self) -> usize {
        self.filter_stats().values().map(|m| m.memory_bytes).sum()
    }

    fn remove_filter(&self, tenant: &TenantId, dataset: &str) -> Result<(), VaultError>;

    /// Serialized filter set (`RVBF` header + postcard payload).
    fn export_filter(&self, tenant: &TenantId, dataset: &str) -> Result<Vec<u8>, VaultError>;
}

// =============================================================================
// AUTO BUILD
// =============================================================================

/// Result hook that builds a filter whenever a stored result is large.
pub struct AutoBloomHook {
    index: Arc<dyn FilterIndex>,
    threshold: usize,
}

impl AutoBloomHook {
    /// Build filters for results with strictly more than `threshold` rows.
    pub fn new(index: Arc<dyn FilterIndex>, threshold: usize) -> Self {
        Self { index, threshold }
    }
}

impl ResultHook for AutoBloomHook {
    fn name(&self) -> &str {
        "auto-bloom"
    }

    fn on_stored(&self, result: &StoredResult<'_>) -> Result<(), VaultError> {
        if result.rows.len() <= self.threshold {
            return Ok(());
        }
        let metadata = self.index.build_filter(
            result.tenant,
            result.dataset_type,
            result.rows,
            result.chunk_size,
        )?;
        tracing::info!(
            tenant = %result.tenant,
            dataset = result.dataset_type,
            rows = metadata.item_count,
            bytes = metadata.memory_bytes,
            "bloom filter auto-built"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{ChunkedResultStore, ResultKey};
    use crate::store::EntityStore;

    fn rows(n: usize) -> Vec<Row> {
        (0..n).map(|i| Row::new().with("name", format!("host-{i}"))).collect()
    }

    #[test]
    fn filter_key_rejects_empty_dataset() {
        let tenant = TenantId::new("t").expect("tenant");
        assert!(FilterKey::new(&tenant, " ").is_err());
        assert_eq!(
            FilterKey::new(&tenant, "devices").expect("key").to_string(),
            "t/devices"
        );
    }

    #[test]
    fn auto_hook_builds_only_above_threshold() {
        let tenant = TenantId::new("t").expect("tenant");
        let manager = Arc::new(BloomManager::new());
        let store = ChunkedResultStore::new(Arc::new(EntityStore::in_memory(tenant.clone())));
        store.register_hook(Arc::new(AutoBloomHook::new(manager.clone(), 100)));

        store
            .store_with_chunking(&ResultKey::new("small", "n", "s"), &rows(100), &[], 50)
            .expect("store");
        assert!(!manager.is_filter_available(&tenant, "small"));

        store
            .store_with_chunking(&ResultKey::new("big", "n", "s"), &rows(101), &[], 50)
            .expect("store");
        assert!(manager.is_filter_available(&tenant, "big"));
        assert_eq!(manager.filter_stats()["t/big"].item_count, 101);
    }
}
