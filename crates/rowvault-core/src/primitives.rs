//! # Primitives
//!
//! Compiled-in constants shared by the rowvault components.

/// Default number of rows per chunk observation.
///
/// Chosen so a single chunk fits comfortably inside one LLM tool response.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Number of leading rows copied into a result summary.
pub const PREVIEW_ROWS: usize = 5;

/// Results with strictly more rows than this get a bloom filter built
/// automatically (when an auto-build hook is registered).
pub const AUTO_BLOOM_THRESHOLD: usize = 100;

/// Default target false-positive rate for bloom filters.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Default cap on rows returned by an analytics query without a LIMIT clause.
pub const DEFAULT_ANALYTICS_ROW_LIMIT: usize = 100;

/// Default similarity cache capacity.
pub const DEFAULT_CACHE_ENTRIES: usize = 1000;

/// Default similarity cache TTL (one hour), milliseconds.
pub const DEFAULT_CACHE_TTL_MS: u64 = 60 * 60 * 1000;

/// Default minimum score for `find_similar` results.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.3;

/// Maximum size of a single cached value (16 MB).
pub const MAX_CACHE_VALUE_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// RECORD TYPE TAGS
// =============================================================================

/// Entity type of a chunked query result.
pub const RESULT_ENTITY_TYPE: &str = "nqe_result";

/// Observation type of one chunk of rows.
pub const CHUNK_OBSERVATION_TYPE: &str = "nqe_result_chunk";

/// Observation type of the single summary observation.
pub const SUMMARY_OBSERVATION_TYPE: &str = "nqe_result_summary";

// =============================================================================
// PERSISTENCE FORMAT
// =============================================================================

/// Magic bytes for the serialized bloom index header.
///
/// - File Header = Magic Bytes ("RVBF") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"RVBF";

/// Current bloom index serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 2;

/// File name of the per-tenant knowledge database.
pub const KNOWLEDGE_DB_FILE: &str = "knowledge.redb";

/// Directory (under the tenant directory) holding persisted bloom indices.
pub const BLOOM_DIR: &str = "bloom";

/// File extension of a persisted bloom index.
pub const BLOOM_FILE_EXTENSION: &str = "bloom";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(MAGIC_BYTES, b"RVBF");
    }

    #[test]
    fn summary_and_chunk_tags_differ() {
        assert_ne!(CHUNK_OBSERVATION_TYPE, SUMMARY_OBSERVATION_TYPE);
    }
}
