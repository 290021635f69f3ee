//! # CLI Command Implementations
//!
//! Each command opens the configured tenant's state, does its work and
//! closes the state again so persisted filters are flushed.

use crate::api::{self, AppState};
use crate::config::Config;
use rowvault_core::{QueryResult, Row, VaultError};
use serde::Serialize;

fn print_json(value: &impl Serialize) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Open state, run `work`, close state. The work's error wins over a close error.
fn with_state<T>(
    config: &Config,
    work: impl FnOnce(&AppState) -> Result<T, VaultError>,
) -> Result<T, VaultError> {
    let state = AppState::open(config)?;
    let outcome = work(&state);
    let closed = state.shutdown();
    let value = outcome?;
    closed?;
    Ok(value)
}

fn cell(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(|v| v.as_text())
        .unwrap_or_else(|| "NULL".to_string())
}

/// Pipe-separated table of an analytics result.
pub fn render_table(result: &QueryResult) -> String {
    let mut out = result.columns.join(" | ");
    out.push('\n');
    out.push_str(&"-".repeat(out.len().saturating_sub(1).max(3)));
    for row in &result.rows {
        out.push('\n');
        let cells: Vec<String> = result.columns.iter().map(|c| cell(row, c)).collect();
        out.push_str(&cells.join(" | "));
    }
    out
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

pub async fn cmd_serve(config: &Config, quiet: bool) -> Result<(), VaultError> {
    let state = AppState::open(config)?;
    let addr = config.bind_addr();

    if !quiet {
        println!("Configuration:");
        println!("  Address:  {}", addr);
        println!("  Tenant:   {}", state.tenant);
        println!("  Data dir: {}", config.data_dir.display());
        println!("  Chunk:    {} rows", config.chunking.default_chunk_size);
        println!(
            "  Filters:  auto-built above {} rows at {} false positives",
            config.chunking.auto_bloom_threshold, config.bloom.false_positive_rate
        );
        println!();
        println!("Press Ctrl+C to stop");
        println!();
    }

    api::run_server(&addr, state).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

pub fn cmd_status(config: &Config, json_mode: bool) -> Result<(), VaultError> {
    let status = with_state(config, |state| Ok(state.status()))?;

    if json_mode {
        print_json(&status);
        return Ok(());
    }

    println!("rowvault Status");
    println!("===============");
    println!("Tenant:     {}", status.tenant);
    println!("Data dir:   {}", config.data_dir.display());
    println!("Persistent: {}", status.memory.persistent);
    println!();
    println!("Entities:     {}", status.memory.entity_count);
    for (entity_type, count) in &status.memory.entities_by_type {
        println!("  {:<20} {}", entity_type, count);
    }
    println!("Relations:    {}", status.memory.relation_count);
    println!("Observations: {}", status.memory.observation_count);
    println!();
    println!(
        "Filters:      {} ({} bytes)",
        status.bloom.filters.len(),
        status.bloom.memory_bytes
    );
    println!(
        "Cache:        {}/{} entries, ttl {} s",
        status.cache.total_entries,
        status.cache.max_entries,
        status.cache.ttl_ms / 1000
    );

    Ok(())
}

// =============================================================================
// RESULT COMMANDS
// =============================================================================

pub fn cmd_summary(config: &Config, json_mode: bool, entity: &str) -> Result<(), VaultError> {
    let (name, summary) = with_state(config, |state| {
        let entity = state.entities.get_entity(entity)?;
        let summary = state.results.get_summary(entity.id)?;
        Ok((entity.name, summary))
    })?;

    if json_mode {
        print_json(&summary);
        return Ok(());
    }

    println!("Result:   {}", name);
    println!("Rows:     {}", summary.row_count);
    println!(
        "Chunks:   {} x {} rows{}",
        summary.chunk_count,
        summary.chunk_size,
        if summary.complete { "" } else { " (incomplete)" }
    );
    println!("Columns:  {}", summary.columns.join(", "));
    println!("Preview:");
    for row in &summary.preview_rows {
        println!("  {}", serde_json::to_string(row).unwrap_or_default());
    }

    Ok(())
}

pub fn cmd_analyze(
    config: &Config,
    json_mode: bool,
    entity: &str,
    sql: &str,
) -> Result<(), VaultError> {
    let result = with_state(config, |state| {
        let entity = state.entities.get_entity(entity)?;
        state.analytics.run_query(entity.id, sql)
    })?;

    if json_mode {
        print_json(&result);
        return Ok(());
    }

    println!("{}", render_table(&result));
    println!();
    match result.truncated_to {
        Some(limit) => println!("{} rows (limited to {})", result.rows.len(), limit),
        None => println!("{} rows", result.rows.len()),
    }

    Ok(())
}

// =============================================================================
// SEARCH / STATS COMMANDS
// =============================================================================

pub fn cmd_search(
    config: &Config,
    json_mode: bool,
    text: &str,
    entity_type: Option<&str>,
    limit: usize,
) -> Result<(), VaultError> {
    let hits = with_state(config, |state| {
        state.entities.search_entities(text, entity_type, limit)
    })?;

    if json_mode {
        print_json(&hits);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No matches.");
    }
    for entity in &hits {
        println!("{:>8}  {:<20} {}", entity.id, entity.entity_type, entity.name);
    }

    Ok(())
}

pub fn cmd_bloom_stats(config: &Config, json_mode: bool) -> Result<(), VaultError> {
    let stats = with_state(config, |state| Ok(state.bloom_stats()))?;

    if json_mode {
        print_json(&stats);
        return Ok(());
    }

    if stats.filters.is_empty() {
        println!("No filters built.");
        return Ok(());
    }
    for (key, meta) in &stats.filters {
        println!(
            "{}: {} rows, {} chunks of {}, {} bytes, est. fp {:.4}",
            key,
            meta.item_count,
            meta.chunk_count,
            meta.chunk_size,
            meta.memory_bytes,
            meta.estimated_false_positive_rate
        );
    }
    println!("Total: {} bytes", stats.memory_bytes);

    Ok(())
}
