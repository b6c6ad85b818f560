//! # Quarry
//!
//! The command line tool for the Quarry selection and query algebra.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            apps/quarry (THE BINARY)          │
//! │                                              │
//! │   ┌────────────┐        ┌────────────────┐   │
//! │   │    CLI     │───────▶│   documents    │   │
//! │   │   (clap)   │        │  (toml, json)  │   │
//! │   └─────┬──────┘        └────────────────┘   │
//! │         ▼                                    │
//! │   ┌──────────────┐                           │
//! │   │ quarry-core  │                           │
//! │   │ (THE LOGIC)  │                           │
//! │   └──────────────┘                           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! quarry --catalog quarry.toml catalog
//! quarry selection merge -s Branch "{ name }" "{ branches: * }"
//! quarry query subtract wanted.json fetched.json
//! quarry cache reduce --cached resolved.json wanted.json
//! ```

use clap::Parser;
use quarry::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = cli::Cli::parse();

    // QUARRY_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("QUARRY_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "quarry=debug,quarry_core=debug"
    } else {
        "quarry=warn,quarry_core=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        eprintln!("Quarry v{}", env!("CARGO_PKG_VERSION"));
    }

    match cli::execute(&cli) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            tracing::error!("Error: {}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
