//! CLI command tests against catalogs and documents written to a temp dir.

use clap::Parser;
use quarry::cli::{
    Cli, Commands, SelectionAction, cmd_cache_reduce, cmd_catalog, cmd_pack, cmd_query_merge,
    cmd_query_reshape, cmd_query_subtract, cmd_selection, execute,
};
use quarry_core::QuarryError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CATALOG: &str = r#"
[[schemas]]
name = "Branch"
id = ["id"]

[schemas.properties]
id = {}
name = { optional = true }
owner = { relation = "User" }
branches = { relation = "Branch", to_many = true }

[[schemas]]
name = "User"
id = ["id"]

[schemas.properties]
id = {}
email = { unique = true }
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let workspace = Self {
            dir: TempDir::new().expect("temp dir"),
        };
        workspace.write("quarry.toml", CATALOG);
        workspace
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write");
        path
    }

    fn catalog(&self) -> PathBuf {
        self.dir.path().join("quarry.toml")
    }
}

fn branch_query(workspace: &Workspace, name: &str, selection: &str, ids: &str) -> PathBuf {
    workspace.write(
        name,
        &format!(
            r#"{{"schema": "Branch", "selection": {selection}, "criterion": {{"$entity": {{"id": {{"$inArray": {ids}}}}}}}}}"#
        ),
    )
}

// =============================================================================
// SELECTION COMMANDS
// =============================================================================

#[test]
fn selection_merge_packs_result() {
    let workspace = Workspace::new();
    let out = cmd_selection(
        &workspace.catalog(),
        false,
        SelectionAction::Merge,
        "Branch",
        "{ name }",
        "{ owner: { id } }",
    )
    .expect("merge");
    assert_eq!(out, "{ name, owner }");
}

#[test]
fn selection_subtract_reports_outcome() {
    let workspace = Workspace::new();
    let covered = cmd_selection(
        &workspace.catalog(),
        false,
        SelectionAction::Subtract,
        "Branch",
        "{ name }",
        "{ name, owner }",
    )
    .expect("subtract");
    assert_eq!(covered, "fully covered");

    let json = cmd_selection(
        &workspace.catalog(),
        true,
        SelectionAction::Subtract,
        "Branch",
        "{ name, owner }",
        "{ name }",
    )
    .expect("subtract");
    let value: serde_json::Value = serde_json::from_str(&json).expect("json");
    assert_eq!(value["outcome"], "residual");
    assert_eq!(value["selection"]["owner"]["id"], true);
}

#[test]
fn selection_rejects_incompatible_text() {
    let workspace = Workspace::new();
    let result = cmd_selection(
        &workspace.catalog(),
        false,
        SelectionAction::Merge,
        "Branch",
        "{ name: { x } }",
        "{ name }",
    );
    assert!(result.is_err());
}

#[test]
fn pack_elides_defaults() {
    let workspace = Workspace::new();
    let out = cmd_pack(&workspace.catalog(), false, "Branch", "{ id, name, branches: * }")
        .expect("pack");
    assert_eq!(out, "{ branches: *, name }");
}

// =============================================================================
// QUERY COMMANDS
// =============================================================================

#[test]
fn query_merge_coalesces_ids() {
    let workspace = Workspace::new();
    let a = branch_query(&workspace, "a.json", r#"{"name": true}"#, "[1]");
    let b = branch_query(&workspace, "b.json", r#"{"name": true}"#, "[2]");
    let out = cmd_query_merge(&workspace.catalog(), true, &[a, b]).expect("merge");
    let value: serde_json::Value = serde_json::from_str(&out).expect("json");
    assert_eq!(value["merged"], true);
    assert_eq!(value["queries"].as_array().map(Vec::len), Some(1));
    assert_eq!(
        value["queries"][0]["criterion"]["$entity"]["id"]["$inArray"],
        serde_json::json!([1, 2])
    );
}

#[test]
fn query_merge_text_lists_queries() {
    let workspace = Workspace::new();
    let a = branch_query(&workspace, "a.json", r#"{"name": true}"#, "[1]");
    let b = branch_query(&workspace, "b.json", r#"{"name": true}"#, "[2]");
    let out = cmd_query_merge(&workspace.catalog(), false, &[a, b]).expect("merge");
    assert!(out.starts_with("merged\n  Branch "));
    assert!(out.ends_with("where { id: $inArray(1, 2) }"));
    assert_eq!(out.lines().count(), 2);
}

#[test]
fn query_subtract_lists_residual() {
    let workspace = Workspace::new();
    let what = branch_query(&workspace, "what.json", r#"{"name": true}"#, "[1, 2]");
    let by = branch_query(&workspace, "by.json", "{}", "[1, 2]");
    let out = cmd_query_subtract(&workspace.catalog(), false, &what, &by).expect("subtract");
    assert!(out.starts_with("residual"));
    assert!(out.contains("Branch { name } where"));
}

#[test]
fn query_reshape_reports_open_parts() {
    let workspace = Workspace::new();
    let shape = workspace.write(
        "shape.json",
        r#"{"schema": "Branch", "selection": {}, "criterion_shape": {"id": {"kind": "field", "operators": ["$inArray"]}}}"#,
    );
    let query = branch_query(&workspace, "query.json", r#"{"name": true}"#, "[7]");
    let out = cmd_query_reshape(&workspace.catalog(), true, &shape, &query).expect("reshape");
    let value: serde_json::Value = serde_json::from_str(&out).expect("json");
    assert_eq!(value["servable"], true);
    assert_eq!(value["open_selection"]["name"], true);
    assert_eq!(value["unique_count"], 1);
}

// =============================================================================
// CACHE AND CATALOG COMMANDS
// =============================================================================

#[test]
fn cache_reduce_strips_cached_ids() {
    let workspace = Workspace::new();
    let cached = workspace.write(
        "cached.json",
        r#"[{"schema": "Branch", "selection": {"name": true}, "criterion": {"$entity": {"id": {"$equals": 1}}}}]"#,
    );
    let query = branch_query(&workspace, "query.json", r#"{"name": true}"#, "[1, 2]");
    let out = cmd_cache_reduce(&workspace.catalog(), true, &cached, &query).expect("reduce");
    let value: serde_json::Value = serde_json::from_str(&out).expect("json");
    assert_eq!(value["outcome"], "residual");
    assert_eq!(
        value["queries"][0]["criterion"]["$entity"]["id"]["$equals"],
        serde_json::json!(2)
    );
}

#[test]
fn catalog_lists_defaults() {
    let workspace = Workspace::new();
    let out = cmd_catalog(&workspace.catalog(), false).expect("catalog");
    assert!(out.contains("Branch (id: id)"));
    assert!(out.contains("User (id: id)\n  defaults: { email, id }"));
}

#[test]
fn missing_catalog_is_io_error() {
    let result = cmd_catalog(Path::new("/nonexistent/quarry.toml"), false);
    assert!(matches!(result, Err(QuarryError::IoError(_))));
}

// =============================================================================
// ARGUMENT PARSING
// =============================================================================

#[test]
fn parses_global_flags_and_subcommands() {
    let workspace = Workspace::new();
    let catalog = workspace.catalog();
    let cli = Cli::try_parse_from([
        "quarry",
        "--json-mode",
        "--catalog",
        catalog.to_str().expect("utf-8 path"),
        "selection",
        "intersect",
        "-s",
        "Branch",
        "{ name }",
        "{ owner }",
    ])
    .expect("parse");
    assert!(cli.json_mode);
    assert!(matches!(cli.command, Some(Commands::Selection { .. })));

    let out = execute(&cli).expect("execute");
    let value: serde_json::Value = serde_json::from_str(&out).expect("json");
    assert_eq!(value["outcome"], "shared");
    assert_eq!(value["selection"], serde_json::json!({}));
}
