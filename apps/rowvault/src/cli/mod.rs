//! # rowvault CLI Module
//!
//! ## Available Commands
//!
//! - `serve` - Start the HTTP server
//! - `status` - Show store, filter and cache status
//! - `summary` - Show the summary of a stored result
//! - `analyze` - Run read-only SQL over a stored result
//! - `search` - Keyword search over entities
//! - `bloom-stats` - Show built filters

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use rowvault_core::VaultError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// rowvault - chunked, searchable storage for oversized network query results
#[derive(Parser, Debug)]
#[command(name = "rowvault")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML config file (default: ./rowvault.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show store, filter and cache status
    Status,

    /// Show the summary of a stored result
    Summary {
        /// Result entity id or name (`{query}-{network}-{snapshot}`)
        entity: String,
    },

    /// Run a read-only SQL query over a stored result (table `data`)
    Analyze {
        /// Result entity id or name
        entity: String,

        /// SELECT or WITH statement
        sql: String,
    },

    /// Keyword search over entity names and observations
    Search {
        /// Search text
        text: String,

        /// Only entities of this type
        #[arg(short = 't', long = "type")]
        entity_type: Option<String>,

        /// Maximum number of hits
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show built bloom filters
    BloomStats,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), VaultError> {
    let mut config = Config::load(cli.config.as_deref())?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(&config, cli.quiet).await
        }
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Summary { entity }) => cmd_summary(&config, json_mode, &entity),
        Some(Commands::Analyze { entity, sql }) => cmd_analyze(&config, json_mode, &entity, &sql),
        Some(Commands::Search {
            text,
            entity_type,
            limit,
        }) => cmd_search(&config, json_mode, &text, entity_type.as_deref(), limit),
        Some(Commands::BloomStats) => cmd_bloom_stats(&config, json_mode),
    }
}
