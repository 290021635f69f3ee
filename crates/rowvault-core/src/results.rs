//! # Chunked Result Store
//!
//! Persists a (possibly huge) query result as one entity, N chunk
//! observations and exactly one summary observation, on top of the
//! [`EntityStore`].
//!
//! ## Write Order
//!
//! 1. Find or create the result entity (name `{query}-{network}-{snapshot}`)
//! 2. Drop any previous summary, then any previous chunks
//! 3. Write chunks in order, checking the cancellation flag between writes
//! 4. Write the summary
//! 5. Notify registered [`ResultHook`]s (best-effort)
//!
//! The summary is always written last, so it never claims more rows than are
//! retrievable. An interrupted store writes a partial summary (`complete =
//! false`) describing only the chunks that made it, or removes a freshly
//! created entity that received no chunks at all.

use crate::codec;
use crate::primitives::{
    CHUNK_OBSERVATION_TYPE, DEFAULT_CHUNK_SIZE, PREVIEW_ROWS, RESULT_ENTITY_TYPE,
    SUMMARY_OBSERVATION_TYPE,
};
use crate::store::EntityStore;
use crate::sync::{lock, read, write};
use crate::{EntityId, FieldValue, Metadata, Row, TenantId, VaultError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

// =============================================================================
// RESULT KEY
// =============================================================================

/// Identity of a stored query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub query_id: String,
    pub network_id: String,
    pub snapshot_id: String,
}

impl ResultKey {
    /// Create a key.
    pub fn new(
        query_id: impl Into<String>,
        network_id: impl Into<String>,
        snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            network_id: network_id.into(),
            snapshot_id: snapshot_id.into(),
        }
    }

    /// Deterministic entity name: `{queryID}-{networkID}-{snapshotID}`.
    #[must_use]
    pub fn entity_name(&self) -> String {
        format!("{}-{}-{}", self.query_id, self.network_id, self.snapshot_id)
    }

    fn validate(&self) -> Result<(), VaultError> {
        for (field, value) in [
            ("query id", &self.query_id),
            ("network id", &self.network_id),
            ("snapshot id", &self.snapshot_id),
        ] {
            if value.trim().is_empty() {
                return Err(VaultError::InvalidArgument(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Caller-supplied cancellation signal, checked between chunk writes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// SUMMARY
// =============================================================================

/// Content of the single summary observation of a stored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub row_count: usize,
    pub columns: Vec<String>,
    pub preview_rows: Vec<Row>,
    pub chunk_count: usize,
    pub chunk_size: usize,
    /// False when the store was interrupted; counts then cover only the
    /// chunks actually written.
    pub complete: bool,
    pub stored_at: u64,
}

/// Observer of a store in flight, called after each chunk is written.
pub trait StoreProgress: Send + Sync {
    fn on_chunk(&self, written_rows: usize, written_chunks: usize);
}

/// Options for [`ChunkedResultStore::store_with_options`].
#[derive(Clone)]
pub struct StoreOptions {
    pub chunk_size: usize,
    /// Dataset type handed to hooks (e.g. for filter keys). Defaults to the query id.
    pub dataset_type: Option<String>,
    pub cancel: Option<CancelFlag>,
    pub progress: Option<Arc<dyn StoreProgress>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            dataset_type: None,
            cancel: None,
            progress: None,
        }
    }
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions")
            .field("chunk_size", &self.chunk_size)
            .field("dataset_type", &self.dataset_type)
            .field("cancel", &self.cancel)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// What a completed store produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOutcome {
    pub entity_id: EntityId,
    pub row_count: usize,
    pub chunk_count: usize,
}

// =============================================================================
// HOOKS
// =============================================================================

/// A completed store, as seen by hooks.
#[derive(Debug)]
pub struct StoredResult<'a> {
    pub tenant: &'a TenantId,
    pub entity_id: EntityId,
    pub key: &'a ResultKey,
    pub dataset_type: &'a str,
    pub rows: &'a [Row],
    pub columns: &'a [String],
    pub chunk_size: usize,
}

/// Post-write collaborator notified after every successful store.
///
/// Hooks are best-effort: an error is logged and never fails the store.
pub trait ResultHook: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn on_stored(&self, result: &StoredResult<'_>) -> Result<(), VaultError>;
}

/// Optional usage-tracking side channel. Failures are logged, never returned.
pub trait UsageTracker: Send + Sync {
    fn record_store(
        &self,
        tenant: &TenantId,
        key: &ResultKey,
        row_count: usize,
        chunk_count: usize,
    ) -> Result<(), VaultError>;
}

// =============================================================================
// STORE
// =============================================================================

/// Chunked result persistence on top of an [`EntityStore`].
pub struct ChunkedResultStore {
    entities: Arc<EntityStore>,
    hooks: RwLock<Vec<Arc<dyn ResultHook>>>,
    tracker: Option<Arc<dyn UsageTracker>>,
    /// Serializes stores so two writers never interleave chunks of one result.
    write_gate: Mutex<()>,
}

impl std::fmt::Debug for ChunkedResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedResultStore")
            .field("tenant", self.entities.tenant())
            .field("hooks", &read(&self.hooks).len())
            .field("tracked", &self.tracker.is_some())
            .finish_non_exhaustive()
    }
}

impl ChunkedResultStore {
    /// Create a result store over an entity store.
    #[must_use]
    pub fn new(entities: Arc<EntityStore>) -> Self {
        Self {
            entities,
            hooks: RwLock::new(Vec::new()),
            tracker: None,
            write_gate: Mutex::new(()),
        }
    }

    /// Attach a usage tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn UsageTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// The underlying entity store.
    #[must_use]
    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    /// Register a post-write hook.
    pub fn register_hook(&self, hook: Arc<dyn ResultHook>) {
        tracing::debug!(hook = hook.name(), "result hook registered");
        write(&self.hooks).push(hook);
    }

    /// Store rows in chunks of `chunk_size`. Returns the result entity id.
    pub fn store_with_chunking(
        &self,
        key: &ResultKey,
        rows: &[Row],
        columns: &[String],
        chunk_size: usize,
    ) -> Result<EntityId, VaultError> {
        let options = StoreOptions {
            chunk_size,
            ..StoreOptions::default()
        };
        self.store_with_options(key, rows, columns, &options)
            .map(|outcome| outcome.entity_id)
    }

    /// Store rows with explicit options.
    ///
    /// Re-storing the same key updates the existing entity rather than
    /// creating a duplicate. When `columns` is empty, the first row's columns
    /// are used.
    pub fn store_with_options(
        &self,
        key: &ResultKey,
        rows: &[Row],
        columns: &[String],
        options: &StoreOptions,
    ) -> Result<StoreOutcome, VaultError> {
        let chunk_size = codec::validate_chunk_size(options.chunk_size)?;
        key.validate()?;

        let columns: Vec<String> = if columns.is_empty() {
            rows.first()
                .map(|r| r.columns().map(str::to_string).collect())
                .unwrap_or_default()
        } else {
            columns.to_vec()
        };
        let dataset_type = options
            .dataset_type
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| key.query_id.clone());

        let _gate = lock(&self.write_gate);

        let name = key.entity_name();
        let (entity_id, created) =
            match self.entities.find_entity_by_name(&name, Some(RESULT_ENTITY_TYPE)) {
                Some(existing) => (existing.id, false),
                None => {
                    let mut metadata = Metadata::new();
                    metadata.insert("query_id".into(), FieldValue::from(key.query_id.as_str()));
                    metadata.insert("network_id".into(), FieldValue::from(key.network_id.as_str()));
                    metadata.insert("snapshot_id".into(), FieldValue::from(key.snapshot_id.as_str()));
                    metadata.insert("dataset_type".into(), FieldValue::from(dataset_type.as_str()));
                    let entity = self.entities.create_entity(&name, RESULT_ENTITY_TYPE, metadata)?;
                    (entity.id, true)
                }
            };

        // Summary first: from here until the new summary lands, readers see
        // "no summary yet" rather than a stale row count.
        self.entities
            .delete_observations_of_type(entity_id, SUMMARY_OBSERVATION_TYPE)?;
        self.entities
            .delete_observations_of_type(entity_id, CHUNK_OBSERVATION_TYPE)?;

        let mut written_rows = 0usize;
        let mut written_chunks = 0usize;

        for (index, chunk) in codec::split_rows(rows, chunk_size)?.enumerate() {
            if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                tracing::info!(
                    tenant = %self.entities.tenant(),
                    entity = %entity_id,
                    written_rows,
                    written_chunks,
                    "chunked store cancelled"
                );
                self.settle_partial(entity_id, created, &columns, rows, chunk_size, written_rows, written_chunks);
                return Err(VaultError::Cancelled {
                    written_rows,
                    written_chunks,
                });
            }

            let write = codec::encode_chunk(chunk).and_then(|payload| {
                let mut metadata = Metadata::new();
                metadata.insert("chunk_index".into(), FieldValue::from(index as u64));
                metadata.insert("row_count".into(), FieldValue::from(chunk.len() as u64));
                self.entities
                    .add_observation(entity_id, payload, CHUNK_OBSERVATION_TYPE, metadata)
            });
            if let Err(e) = write {
                tracing::warn!(
                    tenant = %self.entities.tenant(),
                    entity = %entity_id,
                    chunk = index,
                    error = %e,
                    "chunk write failed"
                );
                self.settle_partial(entity_id, created, &columns, rows, chunk_size, written_rows, written_chunks);
                return Err(e);
            }

            written_rows += chunk.len();
            written_chunks += 1;
            if let Some(progress) = &options.progress {
                progress.on_chunk(written_rows, written_chunks);
            }
        }

        let summary = self.build_summary(&columns, rows, chunk_size, written_rows, written_chunks, true);
        if let Err(e) = self.write_summary(entity_id, &summary) {
            // Chunks are all there but unsummarized: callers would see a
            // result without a row count. Remove it instead.
            if created
                && let Err(cleanup) = self.entities.delete_entity(entity_id)
            {
                tracing::warn!(entity = %entity_id, error = %cleanup, "failed to remove unsummarized result entity");
            }
            return Err(e);
        }

        tracing::info!(
            tenant = %self.entities.tenant(),
            entity = %entity_id,
            rows = written_rows,
            chunks = written_chunks,
            "result stored"
        );

        let stored = StoredResult {
            tenant: self.entities.tenant(),
            entity_id,
            key,
            dataset_type: &dataset_type,
            rows,
            columns: &columns,
            chunk_size,
        };
        for hook in read(&self.hooks).iter() {
            if let Err(e) = hook.on_stored(&stored) {
                tracing::warn!(hook = hook.name(), entity = %entity_id, error = %e, "result hook failed");
            }
        }

        if let Some(tracker) = &self.tracker
            && let Err(e) = tracker.record_store(self.entities.tenant(), key, written_rows, written_chunks)
        {
            tracing::warn!(entity = %entity_id, error = %e, "usage tracking failed");
        }

        Ok(StoreOutcome {
            entity_id,
            row_count: written_rows,
            chunk_count: written_chunks,
        })
    }

    fn build_summary(
        &self,
        columns: &[String],
        rows: &[Row],
        chunk_size: usize,
        written_rows: usize,
        written_chunks: usize,
        complete: bool,
    ) -> ResultSummary {
        ResultSummary {
            row_count: written_rows,
            columns: columns.to_vec(),
            preview_rows: rows.iter().take(PREVIEW_ROWS.min(written_rows)).cloned().collect(),
            chunk_count: written_chunks,
            chunk_size,
            complete,
            stored_at: self.entities.clock().now_ms(),
        }
    }

    fn write_summary(&self, entity_id: EntityId, summary: &ResultSummary) -> Result<(), VaultError> {
        let content = serde_json::to_string(summary)?;
        let mut metadata = Metadata::new();
        metadata.insert("row_count".into(), FieldValue::from(summary.row_count as u64));
        metadata.insert("complete".into(), FieldValue::from(summary.complete));
        self.entities
            .add_observation(entity_id, content, SUMMARY_OBSERVATION_TYPE, metadata)?;
        Ok(())
    }

    /// Leave an interrupted store consistent: either absent or partially summarized.
    #[allow(clippy::too_many_arguments)]
    fn settle_partial(
        &self,
        entity_id: EntityId,
        created: bool,
        columns: &[String],
        rows: &[Row],
        chunk_size: usize,
        written_rows: usize,
        written_chunks: usize,
    ) {
        if created && written_chunks == 0 {
            if let Err(e) = self.entities.delete_entity(entity_id) {
                tracing::warn!(entity = %entity_id, error = %e, "failed to remove empty result entity");
            }
            return;
        }
        let summary = self.build_summary(columns, rows, chunk_size, written_rows, written_chunks, false);
        if let Err(e) = self.write_summary(entity_id, &summary) {
            tracing::warn!(entity = %entity_id, error = %e, "partial summary write failed");
            // Without a summary the partial chunks are unaccounted for.
            let cleanup = if created {
                self.entities.delete_entity(entity_id).map(|_| ())
            } else {
                self.entities
                    .delete_observations_of_type(entity_id, CHUNK_OBSERVATION_TYPE)
                    .map(|_| ())
            };
            if let Err(e) = cleanup {
                tracing::warn!(entity = %entity_id, error = %e, "failed to remove partial chunks");
            }
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Entity id of a stored result, if present.
    pub fn find_result(&self, key: &ResultKey) -> Option<EntityId> {
        self.entities
            .find_entity_by_name(&key.entity_name(), Some(RESULT_ENTITY_TYPE))
            .map(|e| e.id)
    }

    /// Serialized chunk payloads in write order.
    pub fn get_chunks(&self, entity_id: EntityId) -> Result<Vec<String>, VaultError> {
        self.entities.get_entity_by_id(entity_id)?;
        Ok(self
            .entities
            .get_observations(entity_id, Some(CHUNK_OBSERVATION_TYPE))
            .into_iter()
            .map(|o| o.content)
            .collect())
    }

    /// All stored rows, decoded and concatenated in order.
    pub fn get_rows(&self, entity_id: EntityId) -> Result<Vec<Row>, VaultError> {
        let chunks = self.get_chunks(entity_id)?;
        codec::reassemble(chunks.iter().map(String::as_str))
    }

    /// The result summary, or `NotFound` if none has been written yet.
    pub fn get_summary(&self, entity_id: EntityId) -> Result<ResultSummary, VaultError> {
        let observation = self
            .entities
            .get_observations(entity_id, Some(SUMMARY_OBSERVATION_TYPE))
            .pop()
            .ok_or_else(|| VaultError::not_found("summary", entity_id, self.entities.tenant()))?;
        serde_json::from_str(&observation.content)
            .map_err(|e| VaultError::SerializationError(format!("Failed to decode summary: {}", e)))
    }
}

// =============================================================================
// TESTS
// =============================================================================
