//! Deterministic cache keys for queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const DOMAIN: &str = "rowvault.query-fingerprint.v1";

/// BLAKE3 digest (hex) of a query's canonical identity.
///
/// Whitespace runs in the query text collapse to one space and object keys
/// in the parameters are sorted, so formatting differences do not change
/// the fingerprint. Tenant and scope are not part of the digest; the cache
/// keys on them separately.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryFingerprint(String);

impl QueryFingerprint {
    /// Fingerprint a query text (or query id) and its parameters.
    #[must_use]
    pub fn of(query: &str, parameters: &Value) -> Self {
        let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
        let mut canonical = String::new();
        write_canonical(parameters, &mut canonical);

        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN.as_bytes());
        hasher.update(&[0]);
        hasher.update(normalized.as_bytes());
        hasher.update(&[0]);
        hasher.update(canonical.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON text with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whitespace_and_key_order_do_not_matter() {
        let a = QueryFingerprint::of(
            "foreach d in network.devices\n  select d.name",
            &json!({"limit": 10, "filter": {"site": "west", "role": "edge"}}),
        );
        let b = QueryFingerprint::of(
            "  foreach d in network.devices select d.name ",
            &json!({"filter": {"role": "edge", "site": "west"}, "limit": 10}),
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn parameters_change_fingerprint() {
        let a = QueryFingerprint::of("q", &json!({"limit": 10}));
        let b = QueryFingerprint::of("q", &json!({"limit": 11}));
        let c = QueryFingerprint::of("q", &Value::Null);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn array_order_matters() {
        let a = QueryFingerprint::of("q", &json!(["x", "y"]));
        let b = QueryFingerprint::of("q", &json!(["y", "x"]));
        assert_ne!(a, b);
    }
}
