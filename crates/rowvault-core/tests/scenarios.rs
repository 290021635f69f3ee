//! End-to-end scenarios across the core components.

use rowvault_core::bloom::PersistentBloomIndex;
use rowvault_core::primitives::{CHUNK_OBSERVATION_TYPE, SUMMARY_OBSERVATION_TYPE};
use rowvault_core::{
    AnalyticsEngine, AutoBloomHook, BloomManager, CacheConfig, CacheScope, ChunkedResultStore,
    Clock, EntityStore, FilterIndex, ManualClock, Metadata, QueryFingerprint, ResultKey, Row,
    SimilarityCache, TenantId, VaultError, codec,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

fn tenant() -> TenantId {
    TenantId::new("fwd.app").expect("tenant")
}

fn devices(n: usize, router_every: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            let name = if i % router_every == 0 {
                format!("router-edge-{i:03}")
            } else {
                format!("switch-access-{i:03}")
            };
            Row::new()
                .with("name", name)
                .with("platform", if i % 2 == 0 { "eos" } else { "ios_xe" })
                .with("mgmt_ip", format!("10.0.{}.{}", i / 250, i % 250))
        })
        .collect()
}

#[test]
fn scenario_a_450_rows_in_200_row_chunks() {
    let store = ChunkedResultStore::new(Arc::new(EntityStore::in_memory(tenant())));
    let rows = devices(450, 10);
    let id = store
        .store_with_chunking(&ResultKey::new("FQ_dev", "n1", "s1"), &rows, &[], 200)
        .expect("store");

    let sizes: Vec<usize> = store
        .get_chunks(id)
        .expect("chunks")
        .iter()
        .map(|c| codec::decode_chunk(c).expect("decode").len())
        .collect();
    assert_eq!(sizes, vec![200, 200, 50]);
    assert_eq!(store.get_summary(id).expect("summary").row_count, 450);
}

#[test]
fn scenario_b_confirmed_bloom_match_count() {
    let manager = BloomManager::new();
    let rows = devices(150, 15);
    manager
        .build_filter(&tenant(), "devices", &rows, 200)
        .expect("build");

    let outcome = manager
        .search(&tenant(), "devices", &["router-edge".to_string()], Some(&rows))
        .expect("search");
    assert_eq!(outcome.matched_count, 10);
    assert_eq!(outcome.matched_items.len(), 10);
    assert!(!outcome.approximate);
}

#[test]
fn scenario_c_analytics_without_chunks_is_no_data() {
    let results = Arc::new(ChunkedResultStore::new(Arc::new(EntityStore::in_memory(tenant()))));
    let id = results
        .store_with_chunking(&ResultKey::new("FQ_empty", "n1", "s1"), &[], &["name".into()], 200)
        .expect("store");

    let engine = AnalyticsEngine::new(results);
    assert!(matches!(
        engine.run_query(id, "SELECT * FROM data"),
        Err(VaultError::NoData(_))
    ));
}

#[test]
fn scenario_d_cache_put_then_get() {
    let cache = SimilarityCache::default();
    let fingerprint = QueryFingerprint::of("foreach d in network.devices select d", &json!({}));
    let scope = CacheScope::new("n1", "s1");
    cache
        .put(&fingerprint, &tenant(), &scope, "devices", "{\"rows\":[]}".into())
        .expect("put");
    assert_eq!(
        cache.get(&fingerprint, &tenant(), &scope).as_deref(),
        Some("{\"rows\":[]}")
    );
}

#[test]
fn cache_entry_expires_without_sweep() {
    let clock = Arc::new(ManualClock::new(0));
    let config = CacheConfig {
        ttl_ms: 60_000,
        ..CacheConfig::default()
    };
    let cache = SimilarityCache::new(config, clock.clone()).expect("cache");
    let fingerprint = QueryFingerprint::of("q", &json!(null));
    let scope = CacheScope::default();
    cache.put(&fingerprint, &tenant(), &scope, "q", "v".into()).expect("put");

    clock.advance_ms(60_000);
    assert!(cache.get(&fingerprint, &tenant(), &scope).is_none());
}

#[test]
fn cascade_delete_leaves_empty_reads() {
    let store = EntityStore::in_memory(tenant());
    let a = store.create_entity("a", "device", Metadata::new()).expect("a");
    let b = store.create_entity("b", "device", Metadata::new()).expect("b");
    store
        .create_relation(a.id, b.id, "connected_to", Metadata::new())
        .expect("relation");
    store
        .add_observation(a.id, "{}".into(), "data", Metadata::new())
        .expect("observation");

    let summary = store.delete_entity(a.id).expect("delete");
    assert_eq!(summary.relations_removed, 1);
    assert_eq!(summary.observations_removed, 1);
    assert!(store.get_observations(a.id, None).is_empty());
    assert!(store.get_relations(a.id, None).is_empty());
    assert!(store.get_relations(b.id, None).is_empty());
}

#[test]
fn large_result_builds_persistent_filter_that_survives_restart() {
    let temp = tempdir().expect("temp dir");
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
    let rows = devices(300, 30);

    {
        let entities = Arc::new(EntityStore::open_with_clock(
            tenant(),
            temp.path(),
            clock.clone(),
        ));
        let bloom = Arc::new(
            PersistentBloomIndex::open(temp.path(), tenant(), 0.01, clock.clone()).expect("bloom"),
        );
        let results = ChunkedResultStore::new(entities);
        results.register_hook(Arc::new(AutoBloomHook::new(bloom.clone(), 100)));

        results
            .store_with_chunking(&ResultKey::new("FQ_dev", "n1", "s1"), &rows, &[], 100)
            .expect("store");
        assert_eq!(bloom.close().expect("close"), 1);
    }

    let entities = EntityStore::open_with_clock(tenant(), temp.path(), clock.clone());
    assert!(entities.is_persistent());
    let result = entities
        .find_entity_by_name("FQ_dev-n1-s1", None)
        .expect("result entity");
    assert_eq!(entities.count_observations(result.id, CHUNK_OBSERVATION_TYPE), 3);
    assert_eq!(entities.count_observations(result.id, SUMMARY_OBSERVATION_TYPE), 1);

    let bloom = PersistentBloomIndex::open(temp.path(), tenant(), 0.01, clock).expect("reopen");
    let outcome = bloom
        .search(&tenant(), "FQ_dev", &["router-edge".to_string()], Some(&rows))
        .expect("search");
    assert_eq!(outcome.matched_count, 10);
}
