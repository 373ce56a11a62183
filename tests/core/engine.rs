use autosnippet::core::db;
use autosnippet::core::error::EngineError;
use autosnippet::core::migration;
use autosnippet::core::paths;
use autosnippet::core::repo;
use autosnippet::core::store::Store;
use autosnippet::plugins::recipes::{self, NewRecipe, Recipe, RecipeContent};
use rusqlite::params;
use std::fs;
use tempfile::tempdir;

fn seeded_project() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().canonicalize().expect("canonical root");
    fs::create_dir_all(root.join("AutoSnippet/recipes")).expect("knowledge dir");
    fs::write(
        root.join("AutoSnippet/boxspec.json"),
        r#"{"name":"demo","schemaVersion":1,"knowledgeBase":{"dir":"AutoSnippet"}}"#,
    )
    .expect("boxspec");
    let store = Store::open(&root).expect("store");
    (tmp, store)
}

#[test]
fn project_root_resolves_from_nested_directory() {
    let (_tmp, store) = seeded_project();
    let nested = store.project_root.join("Sources/App/Deep");
    fs::create_dir_all(&nested).expect("nested");
    let resolved = paths::resolve_project_root(&nested).expect("resolve");
    assert_eq!(resolved, store.project_root);
}

#[test]
fn store_db_migrates_to_latest_and_stays_there() {
    let (_tmp, store) = seeded_project();
    let conn = db::open_store_db(&store).expect("open");
    let version: i64 = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| {
            r.get(0)
        })
        .expect("version");
    assert_eq!(
        version,
        migration::all_migrations().last().unwrap().version
    );

    // Re-opening migrates nothing and commits no new ledger rows.
    let before: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
        .expect("count");
    drop(conn);
    let conn = db::open_store_db(&store).expect("reopen");
    let after: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
        .expect("count");
    assert_eq!(before, after);
}

#[test]
fn every_query_identifier_passes_the_live_whitelist() {
    let (_tmp, store) = seeded_project();
    let conn = db::open_store_db(&store).expect("open");
    for table in [
        "recipes",
        "candidates",
        "snippets",
        "knowledge_edges",
        "guard_violations",
        "audit_logs",
        "sessions",
        "embedding_chunks",
        "keyword_terms",
        "index_state",
        "pagerank",
        "schema_migrations",
    ] {
        repo::validate_table(&conn, table).expect("known table");
    }
    assert!(repo::validate_table(&conn, "recipes--").is_err());
    assert!(repo::validate_column(&conn, "recipes", "drop table").is_err());
}

#[test]
fn active_recipe_invariant_is_enforced_at_upsert() {
    let (_tmp, store) = seeded_project();
    let conn = db::open_store_db(&store).expect("open");

    let mut hollow = Recipe::create(NewRecipe {
        title: "Hollow",
        language: "swift",
        category: "Utility",
        knowledge_type: "code-pattern",
        kind: None,
        trigger: "@hollow",
        content: RecipeContent::default(),
        source_candidate_id: None,
        source_file: None,
    })
    .expect("recipe");
    hollow.status = "active".to_string();
    let err = recipes::upsert(&conn, &hollow).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[test]
fn corrupt_json_column_surfaces_as_schema_error() {
    let (_tmp, store) = seeded_project();
    let conn = db::open_store_db(&store).expect("open");
    conn.execute(
        "INSERT INTO recipes(id, title, language, kind, knowledge_type, content_json,
             created_at, updated_at)
         VALUES('rcp-broken', 'B', 'swift', 'pattern', 'code-pattern', '{not json',
                '0Z', '0Z')",
        params![],
    )
    .expect("seed corrupt row");

    let err = recipes::get(&conn, "rcp-broken").unwrap_err();
    assert!(matches!(err, EngineError::Schema(_)));
}

#[test]
fn write_guard_rejects_escapes_for_every_store_write() {
    let (_tmp, store) = seeded_project();
    let inside = store.knowledge_dir().join("recipes/ok.md");
    store.assert_write_safe(&inside).expect("inside is fine");

    let escape = store.project_root.join("../sibling/evil.md");
    let err = store.assert_write_safe(&escape).unwrap_err();
    assert!(matches!(err, EngineError::PathEscape(_)));
}
