//! Searchable tokens of a row.
//!
//! A search term matches a row when the lowercased term is a substring of
//! one lowercased field. Terms are never split into words: `"router-edge"`
//! does not match a row whose name is `router-core-1` and whose tier is
//! `edge`.
//!
//! Filters index every character trigram of every lowercased field. Every
//! trigram of a term is then a trigram of any field containing it, so
//! checking a filter for a term's trigrams never rejects a row the
//! confirmatory scan would accept. Terms shorter than three characters
//! have no trigrams and prune nothing.

use crate::{Row, VaultError};
use std::collections::BTreeSet;

const GRAM_LEN: usize = 3;

/// Overlapping character trigrams of an already lowercased text.
fn grams(text: &str) -> impl Iterator<Item = String> + '_ {
    let chars: Vec<char> = text.chars().collect();
    let count = chars.len().saturating_sub(GRAM_LEN - 1);
    (0..count).map(move |i| chars[i..i + GRAM_LEN].iter().collect())
}

/// Lowercased text of every non-null field.
fn field_texts(row: &Row) -> impl Iterator<Item = String> + '_ {
    row.iter()
        .filter_map(|(_, value)| value.as_text())
        .map(|text| text.to_lowercase())
}

/// Distinct trigrams of every non-null field of a row.
pub fn row_tokens(row: &Row) -> BTreeSet<String> {
    field_texts(row)
        .flat_map(|text| grams(&text).collect::<Vec<_>>())
        .collect()
}

/// Lowercased search terms.
///
/// Rejects an empty term list and blank terms.
pub fn normalize_terms(terms: &[String]) -> Result<Vec<String>, VaultError> {
    if terms.is_empty() || terms.iter().any(|t| t.trim().is_empty()) {
        return Err(VaultError::InvalidArgument(
            "search terms must be non-empty".to_string(),
        ));
    }
    Ok(terms.iter().map(|t| t.to_lowercase()).collect())
}

/// Distinct trigrams a filter must contain for any term to match.
pub fn term_grams(terms: &[String]) -> Vec<String> {
    let tokens: BTreeSet<String> = terms
        .iter()
        .flat_map(|t| grams(t).collect::<Vec<_>>())
        .collect();
    tokens.into_iter().collect()
}

/// Ground-truth match used by the confirmatory scan. `terms` are lowercased.
pub fn row_matches(row: &Row, terms: &[String]) -> bool {
    let fields: Vec<String> = field_texts(row).collect();
    terms
        .iter()
        .all(|term| fields.iter().any(|field| field.contains(term.as_str())))
}
