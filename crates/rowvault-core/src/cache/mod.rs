//! # Similarity Cache
//!
//! LRU/TTL cache of serialized query results keyed by
//! (tenant, scope, [`QueryFingerprint`]), with a linear-scan similarity
//! index over the original query texts.
//!
//! - Expired entries are invisible to lookups at once and physically
//!   removed only by [`SimilarityCache::clear_expired`].
//! - Caching is best-effort: callers on the request path use
//!   [`SimilarityCache::put_best_effort`], which logs instead of failing.
//! - Embeddings are computed outside the lock.

pub mod fingerprint;
pub mod similarity;

pub use fingerprint::QueryFingerprint;
pub use similarity::{Embedder, cosine_similarity, jaccard_similarity, keywords};

use crate::clock::{Clock, SystemClock};
use crate::primitives::{
    DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_TTL_MS, DEFAULT_SIMILARITY_THRESHOLD,
    MAX_CACHE_VALUE_BYTES,
};
use crate::sync::lock;
use crate::{TenantId, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_ms: u64,
    /// Minimum score reported by `find_similar`.
    pub similarity_threshold: f32,
    pub max_value_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_ENTRIES,
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD as f32,
            max_value_bytes: MAX_CACHE_VALUE_BYTES,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), VaultError> {
        if self.max_entries == 0 {
            return Err(VaultError::InvalidArgument(
                "cache max_entries must be at least 1".to_string(),
            ));
        }
        if self.ttl_ms == 0 {
            return Err(VaultError::InvalidArgument(
                "cache ttl must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(VaultError::InvalidArgument(format!(
                "similarity threshold must be in [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

// =============================================================================
// TYPES
// =============================================================================

/// Which network snapshot a cached result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct CacheScope {
    pub network_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

impl CacheScope {
    pub fn new(network_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            snapshot_id: snapshot_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant: TenantId,
    scope: CacheScope,
    fingerprint: QueryFingerprint,
}

#[derive(Debug)]
struct CacheEntry {
    original_query: String,
    value: String,
    access_count: u64,
    stored_at: u64,
    last_accessed: u64,
    /// Position in the recency order.
    tick: u64,
    keywords: BTreeSet<String>,
    embedding: Option<Vec<f32>>,
}

/// One `find_similar` hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarQuery {
    pub original_query: String,
    pub similarity_score: f32,
    pub access_count: u64,
    pub last_accessed: u64,
    pub fingerprint: QueryFingerprint,
    pub scope: CacheScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups since creation (or the last `clear_all`).
    pub total_queries: u64,
    pub hits: u64,
    pub total_entries: usize,
    pub max_entries: usize,
    pub hit_rate_percent: f64,
    pub threshold: f32,
    pub ttl_ms: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    total_queries: u64,
    hits: u64,
}

impl CacheState {
    /// Move an existing entry to the most recently used position.
    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.next_tick += 1;
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn evict_lru(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, key)) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// CACHE
// =============================================================================

pub struct SimilarityCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    embedder: Option<Arc<dyn Embedder>>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for SimilarityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityCache")
            .field("config", &self.config)
            .field("embedder", &self.embedder.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SimilarityCache {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
            embedder: None,
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl SimilarityCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, VaultError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            embedder: None,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Use embeddings for similarity instead of keyword overlap.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.stored_at) >= self.config.ttl_ms
    }

    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text) {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, using keyword similarity");
                None
            }
        }
    }

    /// Cached value, or `None` when absent or expired.
    pub fn get(
        &self,
        fingerprint: &QueryFingerprint,
        tenant: &TenantId,
        scope: &CacheScope,
    ) -> Option<String> {
        let now = self.clock.now_ms();
        let key = CacheKey {
            tenant: tenant.clone(),
            scope: scope.clone(),
            fingerprint: fingerprint.clone(),
        };

        let mut state = lock(&self.state);
        state.total_queries += 1;

        let live = state
            .entries
            .get(&key)
            .is_some_and(|entry| !self.is_expired(entry, now));
        if !live {
            tracing::debug!(tenant = %tenant, fingerprint = %fingerprint, "cache miss");
            return None;
        }

        state.hits += 1;
        state.touch(&key);
        let entry = state.entries.get_mut(&key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        Some(entry.value.clone())
    }

    /// Insert or overwrite an entry, evicting the least recently used one at capacity.
    pub fn put(
        &self,
        fingerprint: &QueryFingerprint,
        tenant: &TenantId,
        scope: &CacheScope,
        original_query: &str,
        value: String,
    ) -> Result<(), VaultError> {
        if value.len() > self.config.max_value_bytes {
            return Err(VaultError::InvalidArgument(format!(
                "cache value of {} bytes exceeds limit of {} bytes",
                value.len(),
                self.config.max_value_bytes
            )));
        }

        let embedding = self.embed(original_query);
        let now = self.clock.now_ms();
        let key = CacheKey {
            tenant: tenant.clone(),
            scope: scope.clone(),
            fingerprint: fingerprint.clone(),
        };

        let mut state = lock(&self.state);
        let access_count = state.entries.get(&key).map_or(1, |e| e.access_count + 1);
        let tick = state.next_tick;
        state.next_tick += 1;
        let entry = CacheEntry {
            original_query: original_query.to_string(),
            value,
            access_count,
            stored_at: now,
            last_accessed: now,
            tick,
            keywords: keywords(original_query),
            embedding,
        };
        if let Some(old) = state.entries.insert(key.clone(), entry) {
            state.recency.remove(&old.tick);
        }
        state.recency.insert(tick, key);

        let mut evicted = 0usize;
        while state.entries.len() > self.config.max_entries && state.evict_lru() {
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "cache evicted least recently used entries");
        }
        Ok(())
    }

    /// `put` that logs failures instead of returning them.
    pub fn put_best_effort(
        &self,
        fingerprint: &QueryFingerprint,
        tenant: &TenantId,
        scope: &CacheScope,
        original_query: &str,
        value: String,
    ) -> bool {
        match self.put(fingerprint, tenant, scope, original_query, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(tenant = %tenant, fingerprint = %fingerprint, error = %e, "cache put failed");
                false
            }
        }
    }

    /// Cached queries ranked by similarity to `query`, best first.
    ///
    /// Ties go to the more recently accessed entry. Expired entries and
    /// scores below the configured threshold are left out. `tenant = None`
    /// searches every tenant.
    pub fn find_similar(&self, tenant: Option<&TenantId>, query: &str, limit: usize) -> Vec<SimilarQuery> {
        if limit == 0 {
            return Vec::new();
        }
        let query_embedding = self.embed(query);
        let query_keywords = keywords(query);
        let now = self.clock.now_ms();

        let state = lock(&self.state);
        let mut matches: Vec<SimilarQuery> = state
            .entries
            .iter()
            .filter(|(key, entry)| {
                tenant.is_none_or(|t| &key.tenant == t) && !self.is_expired(entry, now)
            })
            .filter_map(|(key, entry)| {
                let score = match (&query_embedding, &entry.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e),
                    _ => jaccard_similarity(&query_keywords, &entry.keywords),
                };
                (score > 0.0 && score >= self.config.similarity_threshold).then(|| SimilarQuery {
                    original_query: entry.original_query.clone(),
                    similarity_score: score,
                    access_count: entry.access_count,
                    last_accessed: entry.last_accessed,
                    fingerprint: key.fingerprint.clone(),
                    scope: key.scope.clone(),
                })
            })
            .collect();
        drop(state);

        matches.sort_by(|a, b| {
            b.similarity_score
                .total_cmp(&a.similarity_score)
                .then(b.last_accessed.cmp(&a.last_accessed))
        });
        matches.truncate(limit);
        matches
    }

    /// Physically remove expired entries. Returns the number removed.
    pub fn clear_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = lock(&self.state);
        let expired: Vec<(CacheKey, u64)> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, entry)| (key.clone(), entry.tick))
            .collect();
        for (key, tick) in &expired {
            state.entries.remove(key);
            state.recency.remove(tick);
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired cache entries cleared");
        }
        expired.len()
    }

    /// Remove everything and reset counters. Returns the number of entries removed.
    pub fn clear_all(&self) -> usize {
        let mut state = lock(&self.state);
        let removed = state.entries.len();
        *state = CacheState::default();
        tracing::info!(removed, "cache cleared");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        let hit_rate_percent = if state.total_queries == 0 {
            0.0
        } else {
            state.hits as f64 * 100.0 / state.total_queries as f64
        };
        CacheStats {
            total_queries: state.total_queries,
            hits: state.hits,
            total_entries: state.entries.len(),
            max_entries: self.config.max_entries,
            hit_rate_percent,
            threshold: self.config.similarity_threshold,
            ttl_ms: self.config.ttl_ms,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).expect("tenant")
    }

    fn scope() -> CacheScope {
        CacheScope::new("net1", "snap1")
    }

    fn fp(q: &str) -> QueryFingerprint {
        QueryFingerprint::of(q, &json!({}))
    }

    fn cache(max_entries: usize, ttl_ms: u64) -> (SimilarityCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = CacheConfig {
            max_entries,
            ttl_ms,
            ..CacheConfig::default()
        };
        (SimilarityCache::new(config, clock.clone()).expect("cache"), clock)
    }

    #[test]
    fn put_then_get_returns_exact_value() {
        let (cache, _) = cache(10, 1_000);
        cache
            .put(&fp("q1"), &tenant("a"), &scope(), "q1", "[{\"x\":1}]".into())
            .expect("put");
        assert_eq!(
            cache.get(&fp("q1"), &tenant("a"), &scope()).as_deref(),
            Some("[{\"x\":1}]")
        );
    }

    #[test]
    fn tenant_and_scope_partition_entries() {
        let (cache, _) = cache(10, 1_000);
        cache.put(&fp("q"), &tenant("a"), &scope(), "q", "v".into()).expect("put");
        assert!(cache.get(&fp("q"), &tenant("b"), &scope()).is_none());
        assert!(cache.get(&fp("q"), &tenant("a"), &CacheScope::new("net1", "snap2")).is_none());
    }

    #[test]
    fn expired_entry_is_invisible_before_sweep() {
        let (cache, clock) = cache(10, 1_000);
        cache.put(&fp("q"), &tenant("a"), &scope(), "q", "v".into()).expect("put");

        clock.advance_ms(999);
        assert!(cache.get(&fp("q"), &tenant("a"), &scope()).is_some());
        clock.advance_ms(1);
        assert!(cache.get(&fp("q"), &tenant("a"), &scope()).is_none());
        assert_eq!(cache.stats().total_entries, 1);

        assert_eq!(cache.clear_expired(), 1);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let (cache, _) = cache(2, 1_000);
        let t = tenant("a");
        cache.put(&fp("one"), &t, &scope(), "one", "1".into()).expect("put");
        cache.put(&fp("two"), &t, &scope(), "two", "2".into()).expect("put");
        // Touch "one" so "two" becomes the eviction victim.
        assert!(cache.get(&fp("one"), &t, &scope()).is_some());
        cache.put(&fp("three"), &t, &scope(), "three", "3".into()).expect("put");

        assert!(cache.get(&fp("one"), &t, &scope()).is_some());
        assert!(cache.get(&fp("two"), &t, &scope()).is_none());
        assert!(cache.get(&fp("three"), &t, &scope()).is_some());
        assert_eq!(cache.stats().total_entries, 2);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let (cache, _) = cache(2, 1_000);
        let t = tenant("a");
        cache.put(&fp("q"), &t, &scope(), "q", "old".into()).expect("put");
        cache.put(&fp("q"), &t, &scope(), "q", "new".into()).expect("put");
        cache.put(&fp("r"), &t, &scope(), "r", "r".into()).expect("put");

        assert_eq!(cache.stats().total_entries, 2);
        assert_eq!(cache.get(&fp("q"), &t, &scope()).as_deref(), Some("new"));
    }

    #[test]
    fn oversized_value_fails_put_but_not_best_effort() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            max_value_bytes: 4,
            ..CacheConfig::default()
        };
        let cache = SimilarityCache::new(config, clock).expect("cache");
        let t = tenant("a");
        assert!(cache.put(&fp("q"), &t, &scope(), "q", "12345".into()).is_err());
        assert!(!cache.put_best_effort(&fp("q"), &t, &scope(), "q", "12345".into()));
        assert!(cache.put_best_effort(&fp("q"), &t, &scope(), "q", "1234".into()));
    }

    #[test]
    fn find_similar_ranks_by_keyword_overlap() {
        let (cache, clock) = cache(10, 100_000);
        let t = tenant("a");
        let queries = [
            "select device names from network devices",
            "select interface errors from network interfaces",
            "count bgp neighbors",
        ];
        for q in queries {
            cache.put(&fp(q), &t, &scope(), q, "v".into()).expect("put");
            clock.advance_ms(10);
        }

        let hits = cache.find_similar(Some(&t), "network devices names", 5);
        assert_eq!(hits[0].original_query, queries[0]);
        assert!(hits.iter().all(|h| h.similarity_score >= 0.3));
        assert!(hits.iter().all(|h| h.original_query != queries[2]));
        assert!(cache.find_similar(Some(&tenant("b")), "network devices names", 5).is_empty());
        assert!(cache.find_similar(None, "network devices names", 0).is_empty());
    }

    #[test]
    fn find_similar_breaks_ties_by_recency() {
        let clock = Arc::new(ManualClock::new(0));
        let config = CacheConfig {
            similarity_threshold: 0.0,
            ..CacheConfig::default()
        };
        let cache = SimilarityCache::new(config, clock.clone()).expect("cache");
        let t = tenant("a");
        cache.put(&fp("a"), &t, &CacheScope::new("n1", ""), "list routers", "v".into()).expect("put");
        clock.advance_ms(5);
        cache.put(&fp("a"), &t, &CacheScope::new("n2", ""), "list routers", "v".into()).expect("put");

        let hits = cache.find_similar(None, "list routers", 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].scope.network_id, "n2");
    }

    struct AxisEmbedder;

    impl Embedder for AxisEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, VaultError> {
            if text.contains("fail") {
                return Err(VaultError::IoError("embedding backend down".into()));
            }
            Ok(if text.contains("bgp") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    #[test]
    fn embedder_scores_with_cosine() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = SimilarityCache::new(CacheConfig::default(), clock)
            .expect("cache")
            .with_embedder(Arc::new(AxisEmbedder));
        let t = tenant("a");
        cache.put(&fp("1"), &t, &scope(), "bgp sessions", "v".into()).expect("put");
        cache.put(&fp("2"), &t, &scope(), "vlan table", "v".into()).expect("put");

        let hits = cache.find_similar(Some(&t), "show bgp peers", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].original_query, "bgp sessions");
        assert!((hits[0].similarity_score - 1.0).abs() < 0.001);

        // Embedding failure falls back to keywords instead of failing.
        let fallback = cache.find_similar(Some(&t), "vlan table fail", 5);
        assert_eq!(fallback[0].original_query, "vlan table");
    }

    #[test]
    fn stats_track_hit_rate_and_clear_all_resets() {
        let (cache, _) = cache(10, 1_000);
        let t = tenant("a");
        cache.put(&fp("q"), &t, &scope(), "q", "v".into()).expect("put");
        cache.get(&fp("q"), &t, &scope());
        cache.get(&fp("missing"), &t, &scope());

        let stats = cache.stats();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.max_entries, 10);

        assert_eq!(cache.clear_all(), 1);
        assert_eq!(cache.stats().total_queries, 0);
    }

    #[test]
    fn invalid_config_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let zero = CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        };
        assert!(SimilarityCache::new(zero, clock.clone()).is_err());
        let threshold = CacheConfig {
            similarity_threshold: 1.5,
            ..CacheConfig::default()
        };
        assert!(SimilarityCache::new(threshold, clock).is_err());
    }
}
