//! # Chunk Codec
//!
//! Splits a tabular result into bounded chunks and reassembles it.
//! Pure data transformation: no state, no I/O.
//!
//! A chunk payload is a JSON array of row objects. Concatenating decoded
//! payloads in write order reproduces the original row sequence.

use crate::{Row, VaultError};

/// Reject a zero chunk size before any state is touched.
pub fn validate_chunk_size(chunk_size: usize) -> Result<usize, VaultError> {
    if chunk_size == 0 {
        return Err(VaultError::InvalidArgument(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    Ok(chunk_size)
}

/// Number of chunks needed for `row_count` rows.
#[must_use]
pub fn chunk_count(row_count: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    row_count.div_ceil(chunk_size)
}

/// Split rows into slices of at most `chunk_size` rows.
pub fn split_rows(rows: &[Row], chunk_size: usize) -> Result<std::slice::Chunks<'_, Row>, VaultError> {
    let chunk_size = validate_chunk_size(chunk_size)?;
    Ok(rows.chunks(chunk_size))
}

/// Serialize one chunk of rows.
pub fn encode_chunk(rows: &[Row]) -> Result<String, VaultError> {
    Ok(serde_json::to_string(rows)?)
}

/// Deserialize one chunk payload.
pub fn decode_chunk(payload: &str) -> Result<Vec<Row>, VaultError> {
    serde_json::from_str(payload)
        .map_err(|e| VaultError::SerializationError(format!("Failed to decode chunk: {}", e)))
}

/// Decode and concatenate chunk payloads in order.
pub fn reassemble<'a, I>(payloads: I) -> Result<Vec<Row>, VaultError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut rows = Vec::new();
    for payload in payloads {
        rows.extend(decode_chunk(payload)?);
    }
    Ok(rows)
}

// =============================================================================
// TESTS
// =============================================================================
