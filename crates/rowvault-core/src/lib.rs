//! # rowvault-core
//!
//! Storage engine that makes oversized network-query results usable from
//! size-limited tool calls.
//!
//! ## Components (leaves first)
//!
//! - `codec`: splits a row set into bounded chunks and reassembles it
//! - `store`: tenant-partitioned knowledge graph (entities, relations,
//!   observations) backed by redb, degrading to memory
//! - `results`: one result = one entity + N chunk observations + one summary
//! - `bloom`: per (tenant, dataset) bloom filter sets for approximate search,
//!   in memory or persisted per tenant
//! - `cache`: LRU/TTL result cache with "queries like this one" lookup
//! - `analytics`: read-only SQL over a stored result via ephemeral SQLite
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies
//! - No ambient singletons: every component is a service object constructed
//!   once and shared by reference
//! - Best-effort side channels (hooks, usage tracking, cache writes) never
//!   fail the operation they are attached to

// =============================================================================
// MODULES
// =============================================================================

pub mod analytics;
pub mod bloom;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod formats;
pub mod primitives;
pub mod results;
pub mod store;
pub mod types;

mod sync;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    Entity, EntityId, FieldValue, Metadata, Observation, ObservationId, Relation, RelationId,
    Row, TenantId, VaultError,
};

// =============================================================================
// RE-EXPORTS: Services
// =============================================================================

pub use analytics::{AnalyticsEngine, QueryResult};
pub use bloom::{
    AutoBloomHook, BloomManager, FilterIndex, FilterMetadata, PersistentBloomIndex, SearchOutcome,
};
pub use cache::{CacheConfig, CacheScope, CacheStats, QueryFingerprint, SimilarQuery, SimilarityCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use results::{
    CancelFlag, ChunkedResultStore, ResultHook, ResultKey, ResultSummary, StoreOptions, StoreProgress,
    StoreOutcome, StoredResult, UsageTracker,
};
pub use store::{DeleteSummary, EntityStore, MemoryStats};
