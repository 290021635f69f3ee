//! # rowvault
//!
//! Chunked, searchable storage for network query results that are too large
//! for a single tool response.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                apps/rowvault (THE BINARY)                │
//! │                                                          │
//! │   ┌─────────────┐        ┌──────────────┐                │
//! │   │    CLI      │        │   HTTP API   │                │
//! │   │   (clap)    │        │    (axum)    │                │
//! │   └──────┬──────┘        └──────┬───────┘                │
//! │          └──────────┬───────────┘                        │
//! │                     ▼                                    │
//! │            ┌────────────────┐                            │
//! │            │ rowvault-core  │  entities, chunks, filters,│
//! │            │  (THE LOGIC)   │  cache, analytics          │
//! │            └────────────────┘                            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! rowvault serve --port 8080
//! rowvault summary FQ_devices-net1-snap1
//! rowvault analyze 42 "SELECT platform, count(*) FROM data GROUP BY platform"
//! ```

use clap::Parser;
use rowvault::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // ROWVAULT_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("ROWVAULT_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rowvault=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
  ┬─┐┌─┐┬ ┬┬  ┬┌─┐┬ ┬┬  ┌┬┐
  ├┬┘│ ││││└┐┌┘├─┤│ ││   │
  ┴└─└─┘└┴┘ └┘ ┴ ┴└─┘┴─┘ ┴

  rowvault v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
