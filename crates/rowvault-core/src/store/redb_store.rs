//! # redb-backed Knowledge Storage
//!
//! Durable backing for the entity store using the redb embedded database.
//!
//! - ACID transactions (a cascade delete commits or rolls back as a unit)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)
//!
//! Records are stored as JSON bytes: metadata values are untagged scalars,
//! which need a self-describing format to read back.
//!
//! ## Layout
//!
//! One database file per tenant, `<data_dir>/<tenant>/knowledge.redb`, with
//! tables for entities, relations, observations and counters. Observations are
//! keyed by `(entity_id, observation_id)` so a range scan over one entity
//! yields its observations in insertion order.

use crate::{Entity, EntityId, Observation, ObservationId, Relation, RelationId, VaultError};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

/// Table for entities: EntityId(u64) -> JSON Entity
const ENTITIES: TableDefinition<u64, &[u8]> = TableDefinition::new("entities");

/// Table for relations: RelationId(u64) -> JSON Relation
const RELATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("relations");

/// Table for observations: (entity_id, observation_id) -> JSON Observation
const OBSERVATIONS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("observations");

/// Table for counters: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_ID_KEY: &str = "next_id";

fn storage_err(e: impl std::fmt::Display) -> VaultError {
    VaultError::IoError(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, VaultError> {
    serde_json::to_vec(value).map_err(|e| VaultError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, VaultError> {
    serde_json::from_slice(bytes).map_err(|e| VaultError::SerializationError(e.to_string()))
}

/// One mutation inside a write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutEntity(Entity),
    PutRelation(Relation),
    PutObservation(Observation),
    DeleteEntity(EntityId),
    DeleteRelation(RelationId),
    DeleteObservation(EntityId, ObservationId),
}

/// Everything persisted for a tenant, loaded at open.
#[derive(Debug, Default)]
pub struct KnowledgeSnapshot {
    pub entities: BTreeMap<EntityId, Entity>,
    pub relations: BTreeMap<RelationId, Relation>,
    pub observations: Vec<Observation>,
    pub next_id: u64,
}

/// A disk-backed knowledge store using redb.
pub struct RedbKnowledge {
    db: Database,
}

impl std::fmt::Debug for RedbKnowledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbKnowledge").finish_non_exhaustive()
    }
}

impl RedbKnowledge {
    /// Open or create a knowledge database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let db = Database::create(path.as_ref())
            .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            let _ = write_txn.open_table(ENTITIES).map_err(storage_err)?;
            let _ = write_txn.open_table(RELATIONS).map_err(storage_err)?;
            let _ = write_txn.open_table(OBSERVATIONS).map_err(storage_err)?;
            let _ = write_txn.open_table(METADATA).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }

        Ok(Self { db })
    }

    /// Load every record. Observations come back ordered by (entity, id).
    pub fn load(&self) -> Result<KnowledgeSnapshot, VaultError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let mut snapshot = KnowledgeSnapshot::default();

        {
            let table = read_txn.open_table(ENTITIES).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (_, value) = entry.map_err(storage_err)?;
                let entity: Entity = decode(value.value())?;
                snapshot.entities.insert(entity.id, entity);
            }
        }

        {
            let table = read_txn.open_table(RELATIONS).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (_, value) = entry.map_err(storage_err)?;
                let relation: Relation = decode(value.value())?;
                snapshot.relations.insert(relation.id, relation);
            }
        }

        {
            let table = read_txn.open_table(OBSERVATIONS).map_err(storage_err)?;
            for entry in table.iter().map_err(storage_err)? {
                let (_, value) = entry.map_err(storage_err)?;
                snapshot.observations.push(decode(value.value())?);
            }
        }

        snapshot.next_id = {
            let table = read_txn.open_table(METADATA).map_err(storage_err)?;
            table
                .get(NEXT_ID_KEY)
                .map_err(storage_err)?
                .map(|v| v.value())
                .unwrap_or(0)
        };

        Ok(snapshot)
    }

    /// Apply a batch of mutations in a single ACID transaction.
    ///
    /// `next_id` is only ever raised, never lowered, so batches committed out
    /// of allocation order cannot roll the counter back.
    pub fn apply(&self, ops: &[WriteOp], next_id: u64) -> Result<(), VaultError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut entities = write_txn.open_table(ENTITIES).map_err(storage_err)?;
            let mut relations = write_txn.open_table(RELATIONS).map_err(storage_err)?;
            let mut observations = write_txn.open_table(OBSERVATIONS).map_err(storage_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(storage_err)?;

            for op in ops {
                match op {
                    WriteOp::PutEntity(entity) => {
                        let bytes = encode(entity)?;
                        entities
                            .insert(entity.id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    WriteOp::PutRelation(relation) => {
                        let bytes = encode(relation)?;
                        relations
                            .insert(relation.id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    WriteOp::PutObservation(observation) => {
                        let bytes = encode(observation)?;
                        observations
                            .insert(
                                (observation.entity_id.0, observation.id.0),
                                bytes.as_slice(),
                            )
                            .map_err(storage_err)?;
                    }
                    WriteOp::DeleteEntity(id) => {
                        entities.remove(id.0).map_err(storage_err)?;
                    }
                    WriteOp::DeleteRelation(id) => {
                        relations.remove(id.0).map_err(storage_err)?;
                    }
                    WriteOp::DeleteObservation(entity, id) => {
                        observations.remove((entity.0, id.0)).map_err(storage_err)?;
                    }
                }
            }

            let stored = meta
                .get(NEXT_ID_KEY)
                .map_err(storage_err)?
                .map(|v| v.value())
                .unwrap_or(0);
            if next_id > stored {
                meta.insert(NEXT_ID_KEY, next_id).map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
