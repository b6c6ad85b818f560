//! # Quarry CLI Module
//!
//! This module implements the CLI interface for Quarry.
//!
//! ## Available Commands
//!
//! - `selection merge|intersect|subtract|pack` - Selection algebra on text
//! - `query merge|subtract|reshape` - Query algebra on JSON documents
//! - `cache reduce` - Reduce a query against previously resolved queries
//! - `catalog` - Show schemas and their default selections

mod commands;

use clap::{Parser, Subcommand};
use quarry_core::QuarryError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Quarry - selection and query algebra
///
/// Merges, subtracts and reshapes entity selections, criteria and queries
/// against a schema catalog.
#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML schema catalog
    #[arg(
        short = 'C',
        long,
        global = true,
        env = "QUARRY_CATALOG",
        default_value = "quarry.toml"
    )]
    pub catalog: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Selection algebra on packed selection text
    Selection {
        #[command(subcommand)]
        op: SelectionOp,
    },

    /// Query algebra on JSON query documents
    Query {
        #[command(subcommand)]
        op: QueryOp,
    },

    /// Query cache operations
    Cache {
        #[command(subcommand)]
        op: CacheOp,
    },

    /// Show schemas and their default selections
    Catalog,
}

/// Selection operations. Selections are packed text such as
/// `{ name, branches: * }`, relative to the schema defaults.
#[derive(Subcommand, Debug)]
pub enum SelectionOp {
    /// Union of two selections
    Merge {
        /// Schema both selections belong to
        #[arg(short, long)]
        schema: String,
        left: String,
        right: String,
    },

    /// Keys selected by both selections
    Intersect {
        #[arg(short, long)]
        schema: String,
        left: String,
        right: String,
    },

    /// What of `what` is not selected by `by`
    Subtract {
        #[arg(short, long)]
        schema: String,
        what: String,
        by: String,
    },

    /// Pack a full selection relative to the schema defaults
    Pack {
        #[arg(short, long)]
        schema: String,
        selection: String,
    },
}

/// Query operations on JSON documents.
#[derive(Subcommand, Debug)]
pub enum QueryOp {
    /// Coalesce queries until no two merge
    Merge {
        /// Query documents
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// What of one query is not fetched by another
    Subtract { what: PathBuf, by: PathBuf },

    /// Split a query into what a source shape serves and what stays open
    Reshape {
        /// Shape document of the source
        #[arg(short, long)]
        shape: PathBuf,
        query: PathBuf,
    },
}

/// Cache operations.
#[derive(Subcommand, Debug)]
pub enum CacheOp {
    /// Strip cached parts from a query
    Reduce {
        /// JSON array of resolved query documents
        #[arg(short, long)]
        cached: PathBuf,
        query: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments and return the rendered output.
pub fn execute(cli: &Cli) -> Result<String, QuarryError> {
    let json_mode = cli.json_mode;

    let Some(command) = &cli.command else {
        // No subcommand - show the catalog by default
        return cmd_catalog(&cli.catalog, json_mode);
    };

    match command {
        Commands::Selection { op } => match op {
            SelectionOp::Merge {
                schema,
                left,
                right,
            } => cmd_selection(
                &cli.catalog,
                json_mode,
                SelectionAction::Merge,
                schema,
                left,
                right,
            ),
            SelectionOp::Intersect {
                schema,
                left,
                right,
            } => cmd_selection(
                &cli.catalog,
                json_mode,
                SelectionAction::Intersect,
                schema,
                left,
                right,
            ),
            SelectionOp::Subtract { schema, what, by } => cmd_selection(
                &cli.catalog,
                json_mode,
                SelectionAction::Subtract,
                schema,
                what,
                by,
            ),
            SelectionOp::Pack { schema, selection } => {
                cmd_pack(&cli.catalog, json_mode, schema, selection)
            }
        },
        Commands::Query { op } => match op {
            QueryOp::Merge { files } => cmd_query_merge(&cli.catalog, json_mode, files),
            QueryOp::Subtract { what, by } => cmd_query_subtract(&cli.catalog, json_mode, what, by),
            QueryOp::Reshape { shape, query } => {
                cmd_query_reshape(&cli.catalog, json_mode, shape, query)
            }
        },
        Commands::Cache { op } => match op {
            CacheOp::Reduce { cached, query } => {
                cmd_cache_reduce(&cli.catalog, json_mode, cached, query)
            }
        },
        Commands::Catalog => cmd_catalog(&cli.catalog, json_mode),
    }
}
