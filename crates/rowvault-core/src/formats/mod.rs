//! # Formats
//!
//! On-disk encodings owned by the core.

pub mod persistence;

pub use persistence::{PersistedFilter, PersistenceHeader, filter_from_bytes, filter_to_bytes};
