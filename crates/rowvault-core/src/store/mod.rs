//! # Entity Store
//!
//! Knowledge-graph persistence partitioned by tenant: entities, relations and
//! observations.
//!
//! ## Storage Backends
//!
//! - Persistent: redb database at `<data_dir>/<tenant>/knowledge.redb`.
//!   Loaded into memory at open; every write commits to redb first and
//!   updates memory only after the commit succeeds.
//! - In-memory: used when the database cannot be opened (logged once) or when
//!   constructed explicitly with [`EntityStore::in_memory`].
//!
//! ## Locking
//!
//! One `RwLock` per collection. Multi-collection operations acquire locks in
//! the fixed order entities → relations → observations.
//!
//! ## Relation Direction
//!
//! `get_relations` is direction-agnostic: it returns every relation where the
//! entity is either endpoint.

mod redb_store;

pub use redb_store::{KnowledgeSnapshot, RedbKnowledge, WriteOp};

use crate::clock::{Clock, SystemClock};
use crate::primitives::KNOWLEDGE_DB_FILE;
use crate::sync::{read, write};
use crate::{
    Entity, EntityId, Metadata, Observation, ObservationId, Relation, RelationId, TenantId,
    VaultError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Treat an empty type filter as "all types".
fn normalize_filter(filter: Option<&str>) -> Option<&str> {
    filter.filter(|f| !f.is_empty())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), VaultError> {
    if value.trim().is_empty() {
        return Err(VaultError::InvalidArgument(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Observations indexed by owner so per-entity scans come out in id order.
#[derive(Debug, Default)]
struct ObservationIndex {
    by_entity: BTreeMap<(EntityId, ObservationId), Observation>,
    owner: BTreeMap<ObservationId, EntityId>,
}

impl ObservationIndex {
    fn insert(&mut self, observation: Observation) {
        self.owner.insert(observation.id, observation.entity_id);
        self.by_entity
            .insert((observation.entity_id, observation.id), observation);
    }

    fn remove(&mut self, id: ObservationId) -> Option<Observation> {
        let entity = self.owner.remove(&id)?;
        self.by_entity.remove(&(entity, id))
    }

    fn for_entity(&self, entity: EntityId) -> impl Iterator<Item = &Observation> {
        self.by_entity
            .range((entity, ObservationId(0))..=(entity, ObservationId(u64::MAX)))
            .map(|(_, o)| o)
    }
}

/// Counts reported by [`EntityStore::memory_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub tenant: String,
    pub persistent: bool,
    pub entity_count: usize,
    pub relation_count: usize,
    pub observation_count: usize,
    pub entities_by_type: BTreeMap<String, usize>,
    pub relations_by_type: BTreeMap<String, usize>,
    pub observations_by_type: BTreeMap<String, usize>,
}

/// What a cascading entity delete removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub relations_removed: usize,
    pub observations_removed: usize,
}

/// Tenant-partitioned knowledge-graph store.
pub struct EntityStore {
    tenant: TenantId,
    entities: RwLock<BTreeMap<EntityId, Entity>>,
    relations: RwLock<BTreeMap<RelationId, Relation>>,
    observations: RwLock<ObservationIndex>,
    next_id: AtomicU64,
    backend: Option<RedbKnowledge>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("tenant", &self.tenant)
            .field("persistent", &self.backend.is_some())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EntityStore {
    /// Create a volatile store.
    #[must_use]
    pub fn in_memory(tenant: TenantId) -> Self {
        Self::in_memory_with_clock(tenant, Arc::new(SystemClock))
    }

    /// Create a volatile store with an explicit clock.
    #[must_use]
    pub fn in_memory_with_clock(tenant: TenantId, clock: Arc<dyn Clock>) -> Self {
        Self {
            tenant,
            entities: RwLock::new(BTreeMap::new()),
            relations: RwLock::new(BTreeMap::new()),
            observations: RwLock::new(ObservationIndex::default()),
            next_id: AtomicU64::new(1),
            backend: None,
            clock,
        }
    }

    /// Open the tenant's durable store under `data_dir`.
    ///
    /// Never fails: if the database cannot be opened or loaded, the store
    /// degrades to in-memory operation and logs the degradation once.
    pub fn open(tenant: TenantId, data_dir: impl AsRef<Path>) -> Self {
        Self::open_with_clock(tenant, data_dir, Arc::new(SystemClock))
    }

    /// Open with an explicit clock.
    pub fn open_with_clock(
        tenant: TenantId,
        data_dir: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        match Self::try_open(&tenant, data_dir.as_ref(), clock.clone()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    error = %e,
                    "knowledge store unavailable, continuing in-memory only"
                );
                Self::in_memory_with_clock(tenant, clock)
            }
        }
    }

    /// Open the tenant's durable store, failing if it is unavailable.
    pub fn try_open(
        tenant: &TenantId,
        data_dir: &Path,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        let dir = data_dir.join(tenant.as_str());
        std::fs::create_dir_all(&dir)
            .map_err(|e| VaultError::StorageUnavailable(format!("{}: {}", dir.display(), e)))?;
        let backend = RedbKnowledge::open(dir.join(KNOWLEDGE_DB_FILE))?;
        let snapshot = backend
            .load()
            .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;

        // The stored counter may lag the data if batches committed out of
        // allocation order; never hand out an id that is already in use.
        let max_seen = snapshot
            .entities
            .keys()
            .map(|id| id.0)
            .chain(snapshot.relations.keys().map(|id| id.0))
            .chain(snapshot.observations.iter().map(|o| o.id.0))
            .max()
            .unwrap_or(0);
        let next_id = snapshot.next_id.max(max_seen.saturating_add(1)).max(1);

        let mut observations = ObservationIndex::default();
        for observation in snapshot.observations {
            observations.insert(observation);
        }

        tracing::debug!(
            tenant = %tenant,
            entities = snapshot.entities.len(),
            relations = snapshot.relations.len(),
            observations = observations.owner.len(),
            "knowledge store loaded"
        );

        Ok(Self {
            tenant: tenant.clone(),
            entities: RwLock::new(snapshot.entities),
            relations: RwLock::new(snapshot.relations),
            observations: RwLock::new(observations),
            next_id: AtomicU64::new(next_id),
            backend: Some(backend),
            clock,
        })
    }

    /// The tenant this store is partitioned to.
    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Check if writes reach durable storage.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn persist(&self, ops: &[WriteOp]) -> Result<(), VaultError> {
        match &self.backend {
            Some(backend) => backend.apply(ops, self.next_id.load(Ordering::SeqCst)),
            None => Ok(()),
        }
    }

    // =========================================================================
    // ENTITIES
    // =========================================================================

    /// Create an entity with a freshly generated identifier.
    pub fn create_entity(
        &self,
        name: &str,
        entity_type: &str,
        metadata: Metadata,
    ) -> Result<Entity, VaultError> {
        require_non_empty(name, "entity name")?;
        require_non_empty(entity_type, "entity type")?;

        let entity = Entity {
            id: EntityId(self.allocate_id()),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            metadata,
            created_at: self.clock.now_ms(),
        };

        let mut entities = write(&self.entities);
        self.persist(&[WriteOp::PutEntity(entity.clone())])?;
        entities.insert(entity.id, entity.clone());

        tracing::debug!(tenant = %self.tenant, id = %entity.id, name, "entity created");
        Ok(entity)
    }

    /// Get an entity by identifier.
    pub fn get_entity_by_id(&self, id: EntityId) -> Result<Entity, VaultError> {
        read(&self.entities)
            .get(&id)
            .cloned()
            .ok_or_else(|| VaultError::not_found("entity", id, &self.tenant))
    }

    /// Get an entity by identifier, falling back to name.
    ///
    /// Names are not unique; the most recently created match wins.
    pub fn get_entity(&self, id_or_name: &str) -> Result<Entity, VaultError> {
        if let Ok(raw) = id_or_name.trim().parse::<u64>()
            && let Some(entity) = read(&self.entities).get(&EntityId(raw))
        {
            return Ok(entity.clone());
        }
        self.find_entity_by_name(id_or_name, None)
            .ok_or_else(|| VaultError::not_found("entity", id_or_name, &self.tenant))
    }

    /// Most recent entity with this exact name (and type, if given).
    pub fn find_entity_by_name(&self, name: &str, type_filter: Option<&str>) -> Option<Entity> {
        let type_filter = normalize_filter(type_filter);
        read(&self.entities)
            .values()
            .filter(|e| e.name == name)
            .filter(|e| type_filter.is_none_or(|t| e.entity_type == t))
            .max_by_key(|e| (e.created_at, e.id))
            .cloned()
    }

    /// All entities, optionally filtered by type, in id order.
    pub fn list_entities(&self, type_filter: Option<&str>) -> Vec<Entity> {
        let type_filter = normalize_filter(type_filter);
        read(&self.entities)
            .values()
            .filter(|e| type_filter.is_none_or(|t| e.entity_type == t))
            .cloned()
            .collect()
    }

    /// Delete an entity and cascade to its relations and observations.
    pub fn delete_entity(&self, id: EntityId) -> Result<DeleteSummary, VaultError> {
        let mut entities = write(&self.entities);
        let mut relations = write(&self.relations);
        let mut observations = write(&self.observations);

        if !entities.contains_key(&id) {
            return Err(VaultError::not_found("entity", id, &self.tenant));
        }

        let doomed_relations: Vec<RelationId> = relations
            .values()
            .filter(|r| r.touches(id))
            .map(|r| r.id)
            .collect();
        let doomed_observations: Vec<ObservationId> =
            observations.for_entity(id).map(|o| o.id).collect();

        let mut ops = Vec::with_capacity(1 + doomed_relations.len() + doomed_observations.len());
        ops.extend(doomed_relations.iter().map(|r| WriteOp::DeleteRelation(*r)));
        ops.extend(
            doomed_observations
                .iter()
                .map(|o| WriteOp::DeleteObservation(id, *o)),
        );
        ops.push(WriteOp::DeleteEntity(id));
        self.persist(&ops)?;

        for relation in &doomed_relations {
            relations.remove(relation);
        }
        for observation in &doomed_observations {
            observations.remove(*observation);
        }
        entities.remove(&id);

        tracing::debug!(
            tenant = %self.tenant,
            id = %id,
            relations = doomed_relations.len(),
            observations = doomed_observations.len(),
            "entity deleted"
        );
        Ok(DeleteSummary {
            relations_removed: doomed_relations.len(),
            observations_removed: doomed_observations.len(),
        })
    }

    // =========================================================================
    // RELATIONS
    // =========================================================================

    /// Create a directed relation. Both endpoints must exist.
    pub fn create_relation(
        &self,
        from: EntityId,
        to: EntityId,
        relation_type: &str,
        properties: Metadata,
    ) -> Result<Relation, VaultError> {
        require_non_empty(relation_type, "relation type")?;

        let entities = read(&self.entities);
        for endpoint in [from, to] {
            if !entities.contains_key(&endpoint) {
                return Err(VaultError::not_found("entity", endpoint, &self.tenant));
            }
        }

        let relation = Relation {
            id: RelationId(self.allocate_id()),
            from,
            to,
            relation_type: relation_type.to_string(),
            properties,
            created_at: self.clock.now_ms(),
        };

        let mut relations = write(&self.relations);
        self.persist(&[WriteOp::PutRelation(relation.clone())])?;
        relations.insert(relation.id, relation.clone());
        Ok(relation)
    }

    /// Relations where the entity is either endpoint.
    ///
    /// Returns an empty list (not an error) for unknown entities.
    pub fn get_relations(&self, entity: EntityId, type_filter: Option<&str>) -> Vec<Relation> {
        let type_filter = normalize_filter(type_filter);
        read(&self.relations)
            .values()
            .filter(|r| r.touches(entity))
            .filter(|r| type_filter.is_none_or(|t| r.relation_type == t))
            .cloned()
            .collect()
    }

    /// Delete one relation.
    pub fn delete_relation(&self, id: RelationId) -> Result<(), VaultError> {
        let mut relations = write(&self.relations);
        if !relations.contains_key(&id) {
            return Err(VaultError::not_found("relation", id, &self.tenant));
        }
        self.persist(&[WriteOp::DeleteRelation(id)])?;
        relations.remove(&id);
        Ok(())
    }

    // =========================================================================
    // OBSERVATIONS
    // =========================================================================

    /// Attach an observation to an existing entity.
    pub fn add_observation(
        &self,
        entity: EntityId,
        content: String,
        observation_type: &str,
        metadata: Metadata,
    ) -> Result<Observation, VaultError> {
        require_non_empty(observation_type, "observation type")?;

        // Holding the entity read lock keeps a concurrent delete from
        // orphaning the new observation.
        let entities = read(&self.entities);
        if !entities.contains_key(&entity) {
            return Err(VaultError::not_found("entity", entity, &self.tenant));
        }

        let observation = Observation {
            id: ObservationId(self.allocate_id()),
            entity_id: entity,
            content,
            observation_type: observation_type.to_string(),
            metadata,
            created_at: self.clock.now_ms(),
        };

        let mut observations = write(&self.observations);
        self.persist(&[WriteOp::PutObservation(observation.clone())])?;
        observations.insert(observation.clone());
        Ok(observation)
    }

    /// Observations of an entity in insertion order.
    ///
    /// An empty type filter means all types. Unknown entities yield an empty list.
    pub fn get_observations(&self, entity: EntityId, type_filter: Option<&str>) -> Vec<Observation> {
        let type_filter = normalize_filter(type_filter);
        read(&self.observations)
            .for_entity(entity)
            .filter(|o| type_filter.is_none_or(|t| o.observation_type == t))
            .cloned()
            .collect()
    }

    /// Count observations of an entity with the given type.
    pub fn count_observations(&self, entity: EntityId, observation_type: &str) -> usize {
        read(&self.observations)
            .for_entity(entity)
            .filter(|o| o.observation_type == observation_type)
            .count()
    }

    /// Delete one observation.
    pub fn delete_observation(&self, id: ObservationId) -> Result<(), VaultError> {
        let mut observations = write(&self.observations);
        let Some(&entity) = observations.owner.get(&id) else {
            return Err(VaultError::not_found("observation", id, &self.tenant));
        };
        self.persist(&[WriteOp::DeleteObservation(entity, id)])?;
        observations.remove(id);
        Ok(())
    }

    /// Delete every observation of an entity with the given type.
    ///
    /// Returns the number removed.
    pub fn delete_observations_of_type(
        &self,
        entity: EntityId,
        observation_type: &str,
    ) -> Result<usize, VaultError> {
        let mut observations = write(&self.observations);
        let doomed: Vec<ObservationId> = observations
            .for_entity(entity)
            .filter(|o| o.observation_type == observation_type)
            .map(|o| o.id)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        let ops: Vec<WriteOp> = doomed
            .iter()
            .map(|id| WriteOp::DeleteObservation(entity, *id))
            .collect();
        self.persist(&ops)?;
        for id in &doomed {
            observations.remove(*id);
        }
        Ok(doomed.len())
    }

    // =========================================================================
    // SEARCH & STATS
    // =========================================================================

    /// Keyword search over entity names and observation content.
    ///
    /// Each query term scores 3 per name hit and 1 per observation containing
    /// it (case-insensitive). Entities scoring zero are omitted. Ties go to the
    /// most recently created entity.
    pub fn search_entities(
        &self,
        query: &str,
        type_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>, VaultError> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Err(VaultError::InvalidArgument(
                "search query must not be empty".to_string(),
            ));
        }
        let type_filter = normalize_filter(type_filter);

        let entities = read(&self.entities);
        let observations = read(&self.observations);

        let mut scored: Vec<(usize, &Entity)> = entities
            .values()
            .filter(|e| type_filter.is_none_or(|t| e.entity_type == t))
            .filter_map(|entity| {
                let name = entity.name.to_lowercase();
                let mut score = 0usize;
                for term in &terms {
                    if name.contains(term.as_str()) {
                        score += 3;
                    }
                }
                for observation in observations.for_entity(entity.id) {
                    let content = observation.content.to_lowercase();
                    score += terms
                        .iter()
                        .filter(|t| content.contains(t.as_str()))
                        .count();
                }
                (score > 0).then_some((score, entity))
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.cmp(sa)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// Counts by entity type, relation type and observation type.
    pub fn memory_stats(&self) -> MemoryStats {
        let entities = read(&self.entities);
        let relations = read(&self.relations);
        let observations = read(&self.observations);

        let mut stats = MemoryStats {
            tenant: self.tenant.to_string(),
            persistent: self.is_persistent(),
            entity_count: entities.len(),
            relation_count: relations.len(),
            observation_count: observations.owner.len(),
            ..MemoryStats::default()
        };
        for e in entities.values() {
            *stats.entities_by_type.entry(e.entity_type.clone()).or_default() += 1;
        }
        for r in relations.values() {
            *stats.relations_by_type.entry(r.relation_type.clone()).or_default() += 1;
        }
        for o in observations.by_entity.values() {
            *stats
                .observations_by_type
                .entry(o.observation_type.clone())
                .or_default() += 1;
        }
        stats
    }
}

// =============================================================================
// TESTS
// =============================================================================
