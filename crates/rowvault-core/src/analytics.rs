//! # Analytics Reconstructor
//!
//! Answers read-only SQL over a stored result by loading its chunks into an
//! ephemeral in-memory SQLite table named `data`.
//!
//! Schema policy: the first row's columns are authoritative and every
//! column is `TEXT`. A later row missing a column stores NULL there; a later
//! row carrying a column the first row lacks is a `SchemaError`.
//!
//! Each call opens and drops its own connection. Nothing survives a call.

use crate::primitives::DEFAULT_ANALYTICS_ROW_LIMIT;
use crate::results::ChunkedResultStore;
use crate::{EntityId, FieldValue, Row, VaultError, codec};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Name of the ephemeral table.
pub const TABLE_NAME: &str = "data";

/// Rows returned by an analytics query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Set when the default row cap cut the result short.
    pub truncated_to: Option<usize>,
}

pub struct AnalyticsEngine {
    results: Arc<ChunkedResultStore>,
    default_row_limit: usize,
}

impl std::fmt::Debug for AnalyticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEngine")
            .field("default_row_limit", &self.default_row_limit)
            .finish_non_exhaustive()
    }
}

impl AnalyticsEngine {
    #[must_use]
    pub fn new(results: Arc<ChunkedResultStore>) -> Self {
        Self {
            results,
            default_row_limit: DEFAULT_ANALYTICS_ROW_LIMIT,
        }
    }

    /// Override the row cap for queries without a top-level LIMIT. Zero is ignored.
    #[must_use]
    pub fn with_row_limit(mut self, limit: usize) -> Self {
        if limit > 0 {
            self.default_row_limit = limit;
        }
        self
    }

    /// Run a read-only query over every stored row of `entity_id`.
    ///
    /// Unless the statement carries its own top-level LIMIT, at most
    /// `default_row_limit` rows are returned.
    pub fn run_query(&self, entity_id: EntityId, sql: &str) -> Result<QueryResult, VaultError> {
        let shape = StatementShape::of(sql);
        shape.check_read_only()?;
        let statement = &sql[..shape.end];

        let chunks = self.results.get_chunks(entity_id)?;
        if chunks.is_empty() {
            return Err(VaultError::NoData(entity_id));
        }
        let rows = codec::reassemble(chunks.iter().map(String::as_str))?;
        let Some(first) = rows.first() else {
            return Err(VaultError::NoData(entity_id));
        };
        let columns: Vec<String> = first.columns().map(str::to_string).collect();

        let conn = load_table(&columns, &rows)?;
        let cap = (!shape.top_level_limit).then_some(self.default_row_limit);

        let result = execute(&conn, statement, cap)?;
        tracing::debug!(
            entity = %entity_id,
            loaded = rows.len(),
            returned = result.rows.len(),
            truncated = result.truncated_to.is_some(),
            "analytics query executed"
        );
        Ok(result)
    }
}

// =============================================================================
// STATEMENT SHAPE
// =============================================================================

/// The top level of a statement, read past string literals, quoted
/// identifiers, comments and parenthesized subqueries.
#[derive(Debug, PartialEq, Eq)]
struct StatementShape {
    /// First keyword, lowercased.
    leading: Option<String>,
    /// A LIMIT clause outside every parenthesis.
    top_level_limit: bool,
    /// Byte offset where the first statement ends (its `;`, or the end).
    end: usize,
    /// Something other than whitespace or comments follows the first `;`.
    trailing: bool,
}

impl StatementShape {
    fn of(sql: &str) -> Self {
        let mut shape = Self {
            leading: None,
            top_level_limit: false,
            end: sql.len(),
            trailing: false,
        };
        let mut chars = sql.char_indices().peekable();
        let mut depth = 0usize;
        let mut ended = false;

        while let Some((at, c)) = chars.next() {
            match c {
                c if c.is_whitespace() => {}
                '-' if chars.peek().is_some_and(|&(_, n)| n == '-') => {
                    for (_, n) in chars.by_ref() {
                        if n == '\n' {
                            break;
                        }
                    }
                }
                '/' if chars.peek().is_some_and(|&(_, n)| n == '*') => {
                    chars.next();
                    let mut prev = '\0';
                    for (_, n) in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        prev = n;
                    }
                }
                _ if ended => {
                    shape.trailing = true;
                    break;
                }
                '\'' | '"' | '`' => {
                    // A doubled quote is an escaped quote.
                    while let Some((_, n)) = chars.next() {
                        if n == c {
                            if chars.peek().is_some_and(|&(_, m)| m == c) {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                    }
                }
                '[' => {
                    for (_, n) in chars.by_ref() {
                        if n == ']' {
                            break;
                        }
                    }
                }
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ';' if depth == 0 => {
                    shape.end = at;
                    ended = true;
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut word = c.to_lowercase().collect::<String>();
                    while let Some(&(_, n)) = chars.peek() {
                        if !(n.is_alphanumeric() || n == '_' || n == '$') {
                            break;
                        }
                        word.extend(n.to_lowercase());
                        chars.next();
                    }
                    if depth == 0 && word == "limit" {
                        shape.top_level_limit = true;
                    }
                    if shape.leading.is_none() {
                        shape.leading = Some(word);
                    }
                }
                _ => {}
            }
        }
        shape
    }

    /// Accept exactly one SELECT or WITH statement.
    fn check_read_only(&self) -> Result<(), VaultError> {
        match self.leading.as_deref() {
            None => Err(VaultError::QueryError("query is empty".to_string())),
            Some("select" | "with") if self.trailing => Err(VaultError::QueryError(
                "only a single statement is allowed".to_string(),
            )),
            Some("select" | "with") => Ok(()),
            Some(other) => Err(VaultError::QueryError(format!(
                "only SELECT or WITH queries are allowed, got '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn load_table(columns: &[String], rows: &[Row]) -> Result<Connection, VaultError> {
    if columns.is_empty() {
        return Err(VaultError::SchemaError(
            "first row has no columns".to_string(),
        ));
    }
    // SQLite identifiers are case-insensitive.
    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.to_lowercase()) {
            return Err(VaultError::SchemaError(format!(
                "duplicate column '{}' (names are case-insensitive)",
                column
            )));
        }
    }

    let mut conn = Connection::open_in_memory()
        .map_err(|e| VaultError::StorageUnavailable(format!("sqlite: {}", e)))?;

    let column_defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        TABLE_NAME,
        column_defs.join(", ")
    ))
    .map_err(|e| VaultError::SchemaError(e.to_string()))?;

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let insert = format!(
        "INSERT INTO {} VALUES ({})",
        TABLE_NAME,
        placeholders.join(", ")
    );

    let tx = conn
        .transaction()
        .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;
    {
        let mut stmt = tx
            .prepare(&insert)
            .map_err(|e| VaultError::SchemaError(e.to_string()))?;
        for (index, row) in rows.iter().enumerate() {
            if let Some((extra, _)) = row.iter().find(|(name, _)| !columns.iter().any(|c| c == *name)) {
                return Err(VaultError::SchemaError(format!(
                    "row {} has column '{}' not present in the first row",
                    index, extra
                )));
            }
            let values = columns
                .iter()
                .map(|c| row.get(c).and_then(FieldValue::as_text));
            stmt.execute(params_from_iter(values))
                .map_err(|e| VaultError::SchemaError(format!("row {}: {}", index, e)))?;
        }
    }
    tx.commit()
        .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;

    conn.pragma_update(None, "query_only", true)
        .map_err(|e| VaultError::StorageUnavailable(e.to_string()))?;
    Ok(conn)
}

/// Run `sql`, stopping after `cap` rows when a cap applies.
fn execute(conn: &Connection, sql: &str, cap: Option<usize>) -> Result<QueryResult, VaultError> {
    let query_err = |e: rusqlite::Error| VaultError::QueryError(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    if !stmt.readonly() {
        return Err(VaultError::QueryError(
            "only read-only statements are allowed".to_string(),
        ));
    }
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

    let mut out = Vec::new();
    let mut truncated_to = None;
    let mut rows = stmt.query([]).map_err(query_err)?;
    while let Some(row) = rows.next().map_err(query_err)? {
        if cap.is_some_and(|limit| out.len() >= limit) {
            truncated_to = cap;
            break;
        }
        let mut record = Row::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i).map_err(query_err)? {
                ValueRef::Null => FieldValue::Null,
                ValueRef::Integer(n) => FieldValue::from(n),
                ValueRef::Real(f) => FieldValue::from(f),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    FieldValue::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            };
            record.insert(name.clone(), value);
        }
        out.push(record);
    }

    Ok(QueryResult {
        columns,
        rows: out,
        truncated_to,
    })
}

// =============================================================================
// TESTS
// =============================================================================
