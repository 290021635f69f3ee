//! In-memory bloom manager for all tenants of a process.

use super::index::BloomIndex;
use super::{FilterIndex, FilterKey, FilterMetadata, SearchOutcome};
use crate::clock::{Clock, SystemClock};
use crate::formats::{PersistedFilter, filter_to_bytes};
use crate::primitives::DEFAULT_FALSE_POSITIVE_RATE;
use crate::sync::{read, write};
use crate::{Row, TenantId, VaultError};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Filter sets held in process memory, keyed by (tenant, dataset).
#[derive(Debug)]
pub struct BloomManager {
    filters: RwLock<BTreeMap<FilterKey, Arc<BloomIndex>>>,
    false_positive_rate: f64,
    clock: Arc<dyn Clock>,
}

impl Default for BloomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomManager {
    /// Manager with the default 1% false-positive target.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(BTreeMap::new()),
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            clock: Arc::new(SystemClock),
        }
    }

    /// Manager with an explicit target rate and clock.
    pub fn with_config(false_positive_rate: f64, clock: Arc<dyn Clock>) -> Result<Self, VaultError> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(VaultError::InvalidArgument(format!(
                "false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }
        Ok(Self {
            filters: RwLock::new(BTreeMap::new()),
            false_positive_rate,
            clock,
        })
    }

    #[must_use]
    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    /// Build an index for `key` without publishing it.
    pub(crate) fn build_index(&self, rows: &[Row], chunk_size: usize) -> Result<BloomIndex, VaultError> {
        BloomIndex::build(rows, chunk_size, self.false_positive_rate, self.clock.now_ms())
    }

    /// Publish a fully built index, replacing any previous one.
    pub(crate) fn publish(&self, key: FilterKey, index: Arc<BloomIndex>) {
        write(&self.filters).insert(key, index);
    }

    /// Current index for `key`. The returned `Arc` stays valid across rebuilds.
    pub(crate) fn index(&self, key: &FilterKey) -> Option<Arc<BloomIndex>> {
        read(&self.filters).get(key).cloned()
    }

    pub(crate) fn unpublish(&self, key: &FilterKey) -> Option<Arc<BloomIndex>> {
        write(&self.filters).remove(key)
    }

    fn require(&self, key: &FilterKey) -> Result<Arc<BloomIndex>, VaultError> {
        self.index(key)
            .ok_or_else(|| VaultError::not_found("bloom filter", &key.dataset, &key.tenant))
    }
}

impl FilterIndex for BloomManager {
    fn build_filter(
        &self,
        tenant: &TenantId,
        dataset: &str,
        rows: &[Row],
        chunk_size: usize,
    ) -> Result<FilterMetadata, VaultError> {
        let key = FilterKey::new(tenant, dataset)?;
        // Built outside the lock; only the swap is exclusive.
        let index = Arc::new(self.build_index(rows, chunk_size)?);
        let metadata = index.metadata().clone();
        self.publish(key.clone(), index);

        tracing::info!(
            filter = %key,
            rows = metadata.item_count,
            tokens = metadata.token_count,
            chunks = metadata.chunk_count,
            bytes = metadata.memory_bytes,
            "bloom filter built"
        );
        Ok(metadata)
    }

    fn search(
        &self,
        tenant: &TenantId,
        dataset: &str,
        terms: &[String],
        candidates: Option<&[Row]>,
    ) -> Result<SearchOutcome, VaultError> {
        let key = FilterKey::new(tenant, dataset)?;
        let index = self.require(&key)?;
        let outcome = index.search(terms, candidates)?;
        tracing::debug!(
            filter = %key,
            matched = outcome.matched_count,
            skipped = outcome.chunks_skipped,
            micros = outcome.search_time_micros,
            "bloom search"
        );
        Ok(outcome)
    }

    fn is_filter_available(&self, tenant: &TenantId, dataset: &str) -> bool {
        FilterKey::new(tenant, dataset)
            .map(|key| read(&self.filters).contains_key(&key))
            .unwrap_or(false)
    }

    fn filter_stats(&self) -> BTreeMap<String, FilterMetadata> {
        read(&self.filters)
            .iter()
            .map(|(key, index)| (key.to_string(), index.metadata().clone()))
            .collect()
    }

    fn memory_usage(&self) -> usize {
        read(&self.filters)
            .values()
            .map(|index| index.metadata().memory_bytes)
            .sum()
    }

    fn remove_filter(&self, tenant: &TenantId, dataset: &str) -> Result<(), VaultError> {
        let key = FilterKey::new(tenant, dataset)?;
        self.unpublish(&key)
            .map(|_| ())
            .ok_or_else(|| VaultError::not_found("bloom filter", dataset, tenant))
    }

    fn export_filter(&self, tenant: &TenantId, dataset: &str) -> Result<Vec<u8>, VaultError> {
        let key = FilterKey::new(tenant, dataset)?;
        let index = self.require(&key)?;
        filter_to_bytes(&PersistedFilter {
            tenant: tenant.to_string(),
            dataset: dataset.to_string(),
            index: (*index).clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::formats::filter_from_bytes;
    use std::thread;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).expect("tenant")
    }

    fn rows(prefix: &str, n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new().with("name", format!("{prefix}-{i}")))
            .collect()
    }

    fn terms(t: &str) -> Vec<String> {
        vec![t.to_string()]
    }

    #[test]
    fn search_without_filter_is_not_found() {
        let manager = BloomManager::new();
        let err = manager
            .search(&tenant("a"), "devices", &terms("x"), None)
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[test]
    fn filters_are_partitioned_by_tenant() {
        let manager = BloomManager::new();
        manager
            .build_filter(&tenant("a"), "devices", &rows("alpha", 20), 10)
            .expect("build");

        assert!(manager.is_filter_available(&tenant("a"), "devices"));
        assert!(!manager.is_filter_available(&tenant("b"), "devices"));
        assert!(!manager.is_filter_available(&tenant("a"), "interfaces"));
    }

    #[test]
    fn rebuild_replaces_previous_filter() {
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = BloomManager::with_config(0.01, clock.clone()).expect("manager");
        let t = tenant("a");

        manager.build_filter(&t, "devices", &rows("alpha", 10), 5).expect("build");
        clock.advance_ms(500);
        manager.build_filter(&t, "devices", &rows("beta", 30), 5).expect("rebuild");

        let stats = manager.filter_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["a/devices"].item_count, 30);
        assert_eq!(stats["a/devices"].updated_at, 1_500);
        assert_eq!(manager.memory_usage(), stats["a/devices"].memory_bytes);
    }

    #[test]
    fn failed_build_keeps_previous_filter() {
        let manager = BloomManager::new();
        let t = tenant("a");
        manager.build_filter(&t, "devices", &rows("alpha", 10), 5).expect("build");

        assert!(manager.build_filter(&t, "devices", &rows("beta", 10), 0).is_err());
        let outcome = manager
            .search(&t, "devices", &terms("alpha-3"), Some(&rows("alpha", 10)))
            .expect("search");
        assert_eq!(outcome.matched_count, 1);
    }

    #[test]
    fn readers_keep_their_snapshot_during_rebuild() {
        let manager = Arc::new(BloomManager::new());
        let t = tenant("a");
        manager.build_filter(&t, "d", &rows("old", 50), 10).expect("build");

        let key = FilterKey::new(&t, "d").expect("key");
        let held = manager.index(&key).expect("index");

        let writer = {
            let manager = Arc::clone(&manager);
            let t = t.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    manager.build_filter(&t, "d", &rows("new", 80), 10).expect("rebuild");
                }
            })
        };
        writer.join().expect("writer");

        assert_eq!(held.metadata().item_count, 50);
        assert_eq!(manager.index(&key).expect("index").metadata().item_count, 80);
    }

    #[test]
    fn remove_and_export() {
        let manager = BloomManager::new();
        let t = tenant("a");
        manager.build_filter(&t, "d", &rows("x", 5), 5).expect("build");

        let blob = manager.export_filter(&t, "d").expect("export");
        let restored = filter_from_bytes(&blob).expect("decode");
        assert_eq!(restored.dataset, "d");
        assert_eq!(restored.tenant, "a");

        manager.remove_filter(&t, "d").expect("remove");
        assert!(manager.remove_filter(&t, "d").expect_err("gone").is_not_found());
        assert_eq!(manager.memory_usage(), 0);
    }

    #[test]
    fn invalid_rate_rejected() {
        assert!(BloomManager::with_config(1.5, Arc::new(SystemClock)).is_err());
    }
}
