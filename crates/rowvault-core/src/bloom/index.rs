//! # Bloom Index
//!
//! The immutable filter set for one (tenant, dataset) key: a global filter
//! over every token plus one filter per row chunk.
//!
//! An index is built in full and then published; it is never mutated after
//! construction, which is what lets managers swap it in under a lock.

use super::filter::BloomFilter;
use super::tokenize;
use super::{FilterMetadata, SearchOutcome};
use crate::{Row, VaultError, codec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomIndex {
    global: BloomFilter,
    chunks: Vec<BloomFilter>,
    metadata: FilterMetadata,
}

impl BloomIndex {
    /// Build an index over `rows`, one chunk filter per `chunk_size` rows.
    pub fn build(
        rows: &[Row],
        chunk_size: usize,
        false_positive_rate: f64,
        now_ms: u64,
    ) -> Result<Self, VaultError> {
        let chunk_size = codec::validate_chunk_size(chunk_size)?;

        let mut all_tokens: BTreeSet<String> = BTreeSet::new();
        let mut chunks = Vec::with_capacity(codec::chunk_count(rows.len(), chunk_size));

        for chunk in codec::split_rows(rows, chunk_size)? {
            let tokens: BTreeSet<String> = chunk.iter().flat_map(tokenize::row_tokens).collect();
            let mut filter = BloomFilter::with_rate(tokens.len(), false_positive_rate)?;
            for token in &tokens {
                filter.insert(token);
            }
            chunks.push(filter);
            all_tokens.extend(tokens);
        }

        let mut global = BloomFilter::with_rate(all_tokens.len(), false_positive_rate)?;
        for token in &all_tokens {
            global.insert(token);
        }

        let memory_bytes =
            global.memory_bytes() + chunks.iter().map(BloomFilter::memory_bytes).sum::<usize>();

        Ok(Self {
            metadata: FilterMetadata {
                item_count: rows.len(),
                token_count: all_tokens.len(),
                memory_bytes,
                false_positive_rate,
                estimated_false_positive_rate: global.estimated_false_positive_rate(),
                chunk_count: chunks.len(),
                chunk_size,
                updated_at: now_ms,
            },
            global,
            chunks,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &FilterMetadata {
        &self.metadata
    }

    /// Search with AND semantics across `terms`.
    ///
    /// With `candidates`, the rows are expected to be the rows the index was
    /// built from, in the same order: chunks whose filter rejects any term
    /// are skipped and the rest are scanned against ground truth. A
    /// candidate set of a different length is scanned in full.
    ///
    /// Without `candidates`, the result is approximate: `matched_count` is
    /// the number of indexed rows in chunks that accept every term, an upper
    /// bound on the true count.
    pub fn search(&self, terms: &[String], candidates: Option<&[Row]>) -> Result<SearchOutcome, VaultError> {
        let started = Instant::now();
        let terms = tokenize::normalize_terms(terms)?;
        let grams = tokenize::term_grams(&terms);
        let accepts = |filter: &BloomFilter| filter.contains_all(grams.iter().map(String::as_str));

        let global_hit = accepts(&self.global);
        let chunk_hits: Vec<bool> = if global_hit {
            self.chunks.iter().map(accepts).collect()
        } else {
            vec![false; self.chunks.len()]
        };
        let chunks_skipped = chunk_hits.iter().filter(|hit| !**hit).count();

        let (matched_count, matched_items, approximate) = match candidates {
            Some(rows) if rows.len() == self.metadata.item_count => {
                let matched: Vec<Row> = rows
                    .chunks(self.metadata.chunk_size)
                    .zip(&chunk_hits)
                    .filter(|(_, hit)| **hit)
                    .flat_map(|(chunk, _)| chunk.iter())
                    .filter(|row| tokenize::row_matches(row, &terms))
                    .cloned()
                    .collect();
                (matched.len(), matched, false)
            }
            Some(rows) => {
                tracing::debug!(
                    candidates = rows.len(),
                    indexed = self.metadata.item_count,
                    "candidate rows differ from indexed rows, scanning all"
                );
                let matched: Vec<Row> = rows
                    .iter()
                    .filter(|row| tokenize::row_matches(row, &terms))
                    .cloned()
                    .collect();
                (matched.len(), matched, false)
            }
            None => {
                let upper_bound = chunk_hits
                    .iter()
                    .enumerate()
                    .filter(|(_, hit)| **hit)
                    .map(|(i, _)| self.rows_in_chunk(i))
                    .sum();
                (upper_bound, Vec::new(), true)
            }
        };

        Ok(SearchOutcome {
            matched_count,
            matched_items,
            search_time_micros: started.elapsed().as_micros() as u64,
            filter_stats: self.metadata.clone(),
            approximate,
            chunks_scanned: self.chunks.len() - chunks_skipped,
            chunks_skipped,
        })
    }

    fn rows_in_chunk(&self, index: usize) -> usize {
        let start = index * self.metadata.chunk_size;
        self.metadata
            .chunk_size
            .min(self.metadata.item_count.saturating_sub(start))
    }

    /// Structural checks after deserialization.
    pub(crate) fn validate(&self) -> Result<(), VaultError> {
        self.global.validate()?;
        for chunk in &self.chunks {
            chunk.validate()?;
        }
        let expected = codec::chunk_count(self.metadata.item_count, self.metadata.chunk_size);
        if self.metadata.chunk_size == 0 || expected != self.chunks.len() {
            return Err(VaultError::SerializationError(format!(
                "bloom index has {} chunk filters, expected {}",
                self.chunks.len(),
                expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(n: usize, tagged: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let name = if i % (n / tagged) == 0 && i / (n / tagged) < tagged {
                    format!("router-edge-{i}")
                } else {
                    format!("switch-core-{i}")
                };
                Row::new().with("name", name).with("site", format!("site-{}", i % 7))
            })
            .collect()
    }

    fn terms(t: &[&str]) -> Vec<String> {
        t.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_count_with_candidates() {
        let rows = devices(150, 10);
        let index = BloomIndex::build(&rows, 20, 0.01, 1).expect("build");
        let outcome = index
            .search(&terms(&["router-edge"]), Some(&rows))
            .expect("search");
        assert_eq!(outcome.matched_count, 10);
        assert!(!outcome.approximate);
        assert_eq!(outcome.chunks_scanned + outcome.chunks_skipped, 8);
    }

    #[test]
    fn term_split_across_fields_is_not_a_match() {
        let mut rows: Vec<Row> = (0..10)
            .map(|i| Row::new().with("name", format!("router-edge-{i}")).with("tier", "core"))
            .collect();
        rows.extend(
            (0..140).map(|i| Row::new().with("name", format!("router-core-{i}")).with("tier", "edge")),
        );
        let index = BloomIndex::build(&rows, 20, 0.01, 1).expect("build");
        let outcome = index
            .search(&terms(&["router-edge"]), Some(&rows))
            .expect("search");
        assert_eq!(outcome.matched_count, 10);
        assert!(
            outcome
                .matched_items
                .iter()
                .all(|r| r.get("tier").and_then(|v| v.as_text()).as_deref() == Some("core"))
        );
    }

    #[test]
    fn term_inside_a_longer_word_is_found() {
        let rows = vec![Row::new().with("name", "xrouter-edge-1")];
        let index = BloomIndex::build(&rows, 20, 0.01, 1).expect("build");
        let outcome = index
            .search(&terms(&["Router-Edge"]), Some(&rows))
            .expect("search");
        assert_eq!(outcome.matched_count, 1);
        assert_eq!(outcome.chunks_skipped, 0);
    }

    #[test]
    fn approximate_count_is_upper_bound() {
        let rows = devices(150, 10);
        let index = BloomIndex::build(&rows, 20, 0.01, 1).expect("build");
        let outcome = index.search(&terms(&["router", "edge"]), None).expect("search");
        assert!(outcome.approximate);
        assert!(outcome.matched_count >= 10);
        assert!(outcome.matched_items.is_empty());
    }

    #[test]
    fn absent_term_skips_chunks() {
        let rows = devices(100, 10);
        let index = BloomIndex::build(&rows, 10, 0.001, 1).expect("build");
        let outcome = index
            .search(&terms(&["firewall-zzz-unknown"]), Some(&rows))
            .expect("search");
        assert_eq!(outcome.matched_count, 0);
        assert!(outcome.chunks_skipped > 0);
    }

    #[test]
    fn foreign_candidates_are_scanned_in_full() {
        let rows = devices(50, 5);
        let index = BloomIndex::build(&rows, 10, 0.01, 1).expect("build");
        let other = vec![Row::new().with("name", "router-edge-new")];
        let outcome = index
            .search(&terms(&["router-edge"]), Some(&other))
            .expect("search");
        assert_eq!(outcome.matched_count, 1);
    }

    #[test]
    fn metadata_describes_build() {
        let rows = devices(45, 5);
        let index = BloomIndex::build(&rows, 20, 0.01, 42).expect("build");
        let meta = index.metadata();
        assert_eq!(meta.item_count, 45);
        assert_eq!(meta.chunk_count, 3);
        assert_eq!(meta.updated_at, 42);
        assert!(meta.memory_bytes > 0);
        assert!(index.validate().is_ok());
        assert_eq!(index.rows_in_chunk(2), 5);
    }

    #[test]
    fn empty_rows_build_empty_index() {
        let index = BloomIndex::build(&[], 20, 0.01, 1).expect("build");
        assert_eq!(index.metadata().chunk_count, 0);
        let outcome = index.search(&terms(&["x"]), Some(&[])).expect("search");
        assert_eq!(outcome.matched_count, 0);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(BloomIndex::build(&devices(10, 1), 0, 0.01, 1).is_err());
    }
}
