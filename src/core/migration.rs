//! Ordered schema migrations for the store database.
//!
//! Every migration runs inside a transaction and records its version in
//! `schema_migrations` only when that transaction commits. A failed
//! migration rolls back and aborts the process with an error naming the
//! migration; downgrades are not supported.

use crate::core::error::EngineError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{params, Connection};

/// Migration definition.
pub struct Migration {
    /// Strictly increasing version number.
    pub version: i64,
    /// Stable migration name, surfaced in failure messages.
    pub name: &'static str,
    /// Migration body; runs inside the migration transaction.
    pub up: fn(&Connection) -> Result<(), EngineError>,
}

/// All migrations in chronological order.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "base.recipes_candidates_snippets",
            up: migrate_base_tables,
        },
        Migration {
            version: 2,
            name: "recipes.filter_indexes",
            up: migrate_recipe_indexes,
        },
        Migration {
            version: 3,
            name: "audit_logs.append_only",
            up: migrate_audit_logs,
        },
        Migration {
            version: 4,
            name: "sessions.correlation",
            up: migrate_sessions,
        },
        Migration {
            version: 5,
            name: "guard_violations.reports",
            up: migrate_guard_violations,
        },
        Migration {
            version: 6,
            name: "candidates.filter_indexes",
            up: migrate_candidate_indexes,
        },
        Migration {
            version: 7,
            name: "recipes.status_history_column",
            up: migrate_recipe_status_history,
        },
        Migration {
            version: 8,
            name: "index.embedding_chunks",
            up: migrate_embedding_chunks,
        },
        Migration {
            version: 9,
            name: "index.keyword_terms",
            up: migrate_keyword_terms,
        },
        Migration {
            version: 10,
            name: "index.state_doc_len_column",
            up: migrate_index_state_doc_len,
        },
        Migration {
            version: 11,
            name: "graph.pagerank_table",
            up: migrate_pagerank,
        },
        Migration {
            version: 12,
            name: "recipes.source_file_index",
            up: migrate_recipe_source_file_index,
        },
        Migration {
            version: 13,
            name: "graph.edges_backfill_from_relations",
            up: migrate_knowledge_edges_backfill,
        },
    ]
}

/// Run all pending migrations. A database already at the latest version is a
/// no-op and commits no rows.
pub fn run_migrations(conn: &mut Connection) -> Result<(), EngineError> {
    conn.execute(schemas::SCHEMA_MIGRATIONS, [])?;

    let applied_max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for migration in all_migrations() {
        if migration.version <= applied_max {
            continue;
        }
        let tx = conn.transaction()?;
        let result = (migration.up)(&tx).and_then(|_| {
            tx.execute(
                "INSERT INTO schema_migrations(version, applied_at) VALUES(?1, ?2)",
                params![migration.version, time::now_epoch_z()],
            )
            .map_err(EngineError::Storage)?;
            Ok(())
        });
        match result {
            Ok(()) => tx.commit().map_err(EngineError::Storage)?,
            Err(err) => {
                // Dropping the transaction rolls it back; the schema row was
                // never committed so a rerun retries this migration.
                drop(tx);
                return Err(EngineError::Internal(format!(
                    "migration {} '{}' failed and was rolled back: {}",
                    migration.version, migration.name, err
                )));
            }
        }
    }
    Ok(())
}

/// True if `table.column` exists, via `PRAGMA table_info`.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, EngineError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate_base_tables(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::RECIPES_SCHEMA, [])?;
    conn.execute(schemas::CANDIDATES_SCHEMA, [])?;
    conn.execute(schemas::SNIPPETS_SCHEMA, [])?;
    Ok(())
}

fn migrate_recipe_indexes(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::RECIPES_INDEX_STATUS, [])?;
    conn.execute(schemas::RECIPES_INDEX_LANGUAGE, [])?;
    conn.execute(schemas::RECIPES_INDEX_CATEGORY, [])?;
    conn.execute(schemas::RECIPES_INDEX_KIND, [])?;
    Ok(())
}

fn migrate_audit_logs(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::AUDIT_LOGS_SCHEMA, [])?;
    conn.execute(schemas::AUDIT_LOGS_INDEX_TS, [])?;
    conn.execute(schemas::AUDIT_LOGS_INDEX_ACTION, [])?;
    Ok(())
}

fn migrate_sessions(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::SESSIONS_SCHEMA, [])?;
    Ok(())
}

fn migrate_guard_violations(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::GUARD_VIOLATIONS_SCHEMA, [])?;
    Ok(())
}

fn migrate_candidate_indexes(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::CANDIDATES_INDEX_STATUS, [])?;
    conn.execute(schemas::CANDIDATES_INDEX_LANGUAGE, [])?;
    conn.execute(schemas::CANDIDATES_INDEX_CREATED_BY, [])?;
    Ok(())
}

fn migrate_recipe_status_history(conn: &Connection) -> Result<(), EngineError> {
    if !column_exists(conn, "recipes", "status_history_json")? {
        conn.execute(
            "ALTER TABLE recipes ADD COLUMN status_history_json TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }
    Ok(())
}

fn migrate_embedding_chunks(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::EMBEDDING_CHUNKS_SCHEMA, [])?;
    conn.execute(schemas::INDEX_STATE_SCHEMA, [])?;
    Ok(())
}

fn migrate_keyword_terms(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::KEYWORD_TERMS_SCHEMA, [])?;
    conn.execute(schemas::KEYWORD_TERMS_INDEX_TERM, [])?;
    conn.execute(schemas::KEYWORD_TERMS_INDEX_ENTITY, [])?;
    Ok(())
}

fn migrate_index_state_doc_len(conn: &Connection) -> Result<(), EngineError> {
    if !column_exists(conn, "index_state", "doc_len")? {
        conn.execute(
            "ALTER TABLE index_state ADD COLUMN doc_len INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn migrate_pagerank(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::PAGERANK_SCHEMA, [])?;
    Ok(())
}

fn migrate_recipe_source_file_index(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::RECIPES_INDEX_SOURCE_FILE, [])?;
    Ok(())
}

/// Create `knowledge_edges` and back-fill one edge per relation entry found
/// in `recipes.relations_json`. Back-fill targets are matched by exact id
/// against existing recipe rows; unresolved targets still get an edge so the
/// graph can flag orphans.
fn migrate_knowledge_edges_backfill(conn: &Connection) -> Result<(), EngineError> {
    conn.execute(schemas::KNOWLEDGE_EDGES_SCHEMA, [])?;
    conn.execute(schemas::KNOWLEDGE_EDGES_INDEX_FROM, [])?;
    conn.execute(schemas::KNOWLEDGE_EDGES_INDEX_TO, [])?;

    let mut stmt = conn.prepare("SELECT id, relations_json FROM recipes")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let now = time::now_epoch_z();
    for row in rows {
        let (recipe_id, relations_raw) = row?;
        let relations: serde_json::Value = match serde_json::from_str(&relations_raw) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Some(groups) = relations.as_object() else {
            continue;
        };
        for (group, entries) in groups {
            let Some(entries) = entries.as_array() else {
                continue;
            };
            let relation = relation_for_group(group);
            for entry in entries {
                let Some(target) = entry.get("target").and_then(|t| t.as_str()) else {
                    continue;
                };
                let target = target.trim();
                if target.is_empty() {
                    continue;
                }
                conn.execute(
                    "INSERT OR IGNORE INTO knowledge_edges
                         (id, from_id, from_type, to_id, to_type, relation, weight, metadata_json, created_at)
                     VALUES(?1, ?2, 'recipe', ?3, 'recipe', ?4, 1.0, '{}', ?5)",
                    params![
                        crate::core::paths::new_id("edg"),
                        recipe_id,
                        target,
                        relation,
                        now
                    ],
                )?;
            }
        }
    }
    Ok(())
}

/// Map a relation group name from `relations_json` to the edge relation.
fn relation_for_group(group: &str) -> &'static str {
    match group {
        "inherits" => "inherits",
        "implements" => "implements",
        "calls" => "calls",
        "dependsOn" => "depends_on",
        "dataFlow" => "data_flow_to",
        "conflicts" => "conflicts",
        "extends" => "extends",
        _ => "related",
    }
}
