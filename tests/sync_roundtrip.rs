use autosnippet::core::db;
use autosnippet::core::store::Store;
use autosnippet::plugins::recipes;
use autosnippet::plugins::sync::{self, SyncMode};
use std::fs;
use tempfile::tempdir;

const CORPUS_FILE: &str = r#"---
title: Weak delegate reference
trigger: "@weakdelegate"
category: UI
language: swift
summary_cn: 避免循环引用
summary_en: Break retain cycles on delegates
headers: ["import UIKit"]
knowledgeType: best-practice
---

## Snippet / Code Reference

```swift
weak var delegate: SceneDelegate?
```

## AI Context / Usage Guide

Declare delegates weak unless ownership is intended.
"#;

fn project() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::open(tmp.path()).expect("store");
    fs::create_dir_all(store.recipes_dir()).expect("recipes dir");
    (tmp, store)
}

#[test]
fn parse_serialize_parse_is_field_equivalent() {
    let parsed = sync::parse_document(CORPUS_FILE).expect("parse");
    let serialized = sync::serialize_document(&parsed);
    let reparsed = sync::parse_document(&serialized).expect("reparse");
    assert_eq!(parsed, reparsed);
    // Canonical output is a fixed point of the serializer.
    assert_eq!(sync::serialize_document(&reparsed), serialized);
}

#[test]
fn double_sync_produces_zero_deltas() {
    let (_tmp, store) = project();
    fs::write(store.recipes_dir().join("delegate.md"), CORPUS_FILE).expect("write");
    let conn = db::open_store_db(&store).expect("db");

    let first = sync::sync(&store, &conn, SyncMode::Strict).expect("first");
    assert_eq!((first.created, first.updated), (1, 0));

    let second = sync::sync(&store, &conn, SyncMode::Strict).expect("second");
    assert_eq!((second.created, second.updated), (0, 0));
    assert!(second.orphaned.is_empty());
    assert!(second.violations.is_empty());
}

#[test]
fn deleting_the_file_orphans_the_row_without_deleting_it() {
    let (_tmp, store) = project();
    let path = store.recipes_dir().join("delegate.md");
    fs::write(&path, CORPUS_FILE).expect("write");
    let conn = db::open_store_db(&store).expect("db");
    sync::sync(&store, &conn, SyncMode::Strict).expect("sync");

    fs::remove_file(&path).expect("remove");
    let report = sync::sync(&store, &conn, SyncMode::Strict).expect("resync");
    assert_eq!(report.orphaned.len(), 1);

    let rows = recipes::list_all(&conn).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "deprecated");
    assert_eq!(
        rows[0].deprecation.as_ref().expect("deprecation").reason,
        "orphaned"
    );

    // A third run reports nothing new.
    let again = sync::sync(&store, &conn, SyncMode::Strict).expect("third");
    assert!(again.orphaned.is_empty());
}

#[test]
fn database_is_rebuildable_from_the_corpus_alone() {
    let (_tmp, store) = project();
    fs::write(store.recipes_dir().join("delegate.md"), CORPUS_FILE).expect("write");
    {
        let conn = db::open_store_db(&store).expect("db");
        sync::sync(&store, &conn, SyncMode::Strict).expect("sync");
    }
    let before = {
        let conn = db::open_store_db(&store).expect("db");
        recipes::list_all(&conn).expect("rows")
    };

    // Blow the cache away and replay sync from the filesystem.
    fs::remove_file(store.db_path()).expect("drop cache");
    for sidecar in ["autosnippet.db-wal", "autosnippet.db-shm"] {
        let _ = fs::remove_file(store.runtime_dir().join(sidecar));
    }
    let conn = db::open_store_db(&store).expect("fresh db");
    sync::sync(&store, &conn, SyncMode::Strict).expect("replay");
    let after = recipes::list_all(&conn).expect("rows");

    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].id, after[0].id);
    assert_eq!(before[0].title, after[0].title);
    assert_eq!(before[0].content.pattern, after[0].content.pattern);
}

#[test]
fn like_metacharacters_in_search_terms_match_literally() {
    let (_tmp, store) = project();
    let with_percent = CORPUS_FILE.replace(
        "Declare delegates weak unless ownership is intended.",
        "Cuts 100%_of retain cycles.",
    );
    fs::write(store.recipes_dir().join("delegate.md"), with_percent).expect("write");
    let conn = db::open_store_db(&store).expect("db");
    sync::sync(&store, &conn, SyncMode::Strict).expect("sync");

    let hits = recipes::search(&conn, "100%_of").expect("search");
    assert_eq!(hits.len(), 1);
    let misses = recipes::search(&conn, "100X_of").expect("search");
    assert!(misses.is_empty());
}
