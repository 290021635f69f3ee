//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API. Core records
//! (`Entity`, `ResultSummary`, `SearchOutcome`, ...) are returned as-is.

use rowvault_core::{
    CacheStats, FilterMetadata, MemoryStats, Metadata, Row, VaultError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Filter sets currently held and their total footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomStatsResponse {
    pub filters: BTreeMap<String, FilterMetadata>,
    pub memory_bytes: usize,
}

/// Combined status of every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub tenant: String,
    pub memory: MemoryStats,
    pub bloom: BloomStatsResponse,
    pub cache: CacheStats,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Body of every non-2xx response produced by a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable error category, e.g. `not_found`.
    pub kind: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn from_error(error: &VaultError) -> Self {
        let kind = match error {
            VaultError::NotFound { .. } => "not_found",
            VaultError::InvalidArgument(_) => "invalid_argument",
            VaultError::NoData(_) => "no_data",
            VaultError::SchemaError(_) => "schema_error",
            VaultError::QueryError(_) => "query_error",
            VaultError::StorageUnavailable(_) => "storage_unavailable",
            VaultError::Cancelled { .. } => "cancelled",
            VaultError::SerializationError(_) => "serialization_error",
            VaultError::IoError(_) => "io_error",
        };
        Self {
            kind: kind.to_string(),
            error: error.to_string(),
        }
    }
}

// =============================================================================
// KNOWLEDGE GRAPH
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddObservationRequest {
    pub content: String,
    pub observation_type: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRelationRequest {
    pub from: u64,
    pub to: u64,
    pub relation_type: String,
    #[serde(default)]
    pub properties: Metadata,
}

/// `?type=` filter on list endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeFilterQuery {
    #[serde(rename = "type")]
    pub type_filter: Option<String>,
}

/// `GET /entities/search` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySearchQuery {
    pub q: String,
    #[serde(rename = "type")]
    pub type_filter: Option<String>,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    10
}

// =============================================================================
// CHUNKED RESULTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResultRequest {
    pub query_id: String,
    pub network_id: String,
    pub snapshot_id: String,
    pub rows: Vec<Row>,
    /// Column order; defaults to the first row's columns.
    #[serde(default)]
    pub columns: Vec<String>,
    pub chunk_size: Option<usize>,
    pub dataset_type: Option<String>,
}

/// `GET /results/{id}/chunks` parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkQuery {
    /// Return only this chunk (zero-based).
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunksResponse {
    pub entity_id: u64,
    pub chunk_count: usize,
    /// Index of the first returned chunk.
    pub offset: usize,
    pub chunks: Vec<Vec<Row>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub sql: String,
}

// =============================================================================
// BLOOM FILTERS
// =============================================================================

/// Build over inline rows or over a stored result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildFilterRequest {
    pub rows: Option<Vec<Row>>,
    pub entity_id: Option<u64>,
    pub chunk_size: Option<usize>,
}

/// Search terms, optionally confirmed against inline rows or a stored result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSearchRequest {
    pub terms: Vec<String>,
    pub rows: Option<Vec<Row>>,
    pub entity_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFilterResponse {
    pub dataset: String,
    pub size_bytes: usize,
    /// Base64-encoded filter blob.
    pub data: String,
}

// =============================================================================
// CACHE
// =============================================================================

/// Identity of a cached query: text, parameters and snapshot scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLookupRequest {
    pub query: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub network_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheGetResponse {
    pub fingerprint: String,
    pub hit: bool,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePutRequest {
    #[serde(flatten)]
    pub lookup: CacheLookupRequest,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePutResponse {
    pub fingerprint: String,
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSimilarRequest {
    pub query: String,
    #[serde(default = "default_similar_limit")]
    pub limit: usize,
}

fn default_similar_limit() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}
