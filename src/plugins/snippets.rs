//! Snippet subsystem: concrete installable code fragments.
//!
//! A snippet is what the IDE code-snippet mechanism consumes. Install state
//! is tracked on the row; the actual file write goes through the path guard.

use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;

pub const SNIPPET_ID_PREFIX: &str = "snp";

/// A concrete installable code fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub id: String,
    /// Identifier used by the IDE snippet mechanism.
    pub external_id: String,
    pub title: String,
    pub language: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub completion_trigger: String,
    #[serde(default)]
    pub summary: String,
    /// Body lines joined by newlines.
    pub body: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub installed_path: Option<String>,
    #[serde(default)]
    pub source_recipe_id: Option<String>,
    #[serde(default)]
    pub source_candidate_id: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSnippet<'a> {
    pub external_id: &'a str,
    pub title: &'a str,
    pub language: &'a str,
    pub category: &'a str,
    pub completion_trigger: &'a str,
    pub summary: &'a str,
    pub body: &'a str,
    pub source_recipe_id: Option<&'a str>,
    pub source_candidate_id: Option<&'a str>,
}

impl Snippet {
    pub fn create(args: NewSnippet<'_>) -> Result<Snippet, EngineError> {
        if args.title.trim().is_empty() {
            return Err(EngineError::Validation(
                "snippet title must not be empty".to_string(),
            ));
        }
        if args.body.trim().is_empty() {
            return Err(EngineError::Validation(
                "snippet body must not be empty".to_string(),
            ));
        }
        let now = time::now_epoch_z();
        Ok(Snippet {
            id: crate::core::paths::new_id(SNIPPET_ID_PREFIX),
            external_id: args.external_id.to_string(),
            title: args.title.trim().to_string(),
            language: args.language.trim().to_lowercase(),
            category: args.category.to_string(),
            completion_trigger: args.completion_trigger.to_string(),
            summary: args.summary.to_string(),
            body: args.body.to_string(),
            installed: false,
            installed_path: None,
            source_recipe_id: args.source_recipe_id.map(|s| s.to_string()),
            source_candidate_id: args.source_candidate_id.map(|s| s.to_string()),
            metadata: JsonValue::Null,
            created_at: now.clone(),
            updated_at: now,
        })
    }
}

// --- Repository ---

const SELECT_COLUMNS: &str = "id, external_id, title, language, category, completion_trigger,
    summary, body, installed, installed_path, source_recipe_id, source_candidate_id,
    metadata_json, created_at, updated_at";

fn row_to_snippet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snippet> {
    let installed: i64 = row.get(8)?;
    let metadata_raw: String = row.get(12)?;
    Ok(Snippet {
        id: row.get(0)?,
        external_id: row.get(1)?,
        title: row.get(2)?,
        language: row.get(3)?,
        category: row.get(4)?,
        completion_trigger: row.get(5)?,
        summary: row.get(6)?,
        body: row.get(7)?,
        installed: installed != 0,
        installed_path: row.get(9)?,
        source_recipe_id: row.get(10)?,
        source_candidate_id: row.get(11)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(JsonValue::Null),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub fn upsert(conn: &Connection, snippet: &Snippet) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO snippets(id, external_id, title, language, category, completion_trigger,
             summary, body, installed, installed_path, source_recipe_id, source_candidate_id,
             metadata_json, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
             external_id = excluded.external_id, title = excluded.title,
             language = excluded.language, category = excluded.category,
             completion_trigger = excluded.completion_trigger, summary = excluded.summary,
             body = excluded.body, installed = excluded.installed,
             installed_path = excluded.installed_path,
             source_recipe_id = excluded.source_recipe_id,
             source_candidate_id = excluded.source_candidate_id,
             metadata_json = excluded.metadata_json, updated_at = excluded.updated_at",
        params![
            snippet.id,
            snippet.external_id,
            snippet.title,
            snippet.language,
            snippet.category,
            snippet.completion_trigger,
            snippet.summary,
            snippet.body,
            snippet.installed as i64,
            snippet.installed_path,
            snippet.source_recipe_id,
            snippet.source_candidate_id,
            snippet.metadata.to_string(),
            snippet.created_at,
            snippet.updated_at,
        ],
    )
    .map_err(|e| EngineError::from_storage(e, &format!("snippet {}", snippet.id)))?;
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Snippet, EngineError> {
    let sql = format!("SELECT {} FROM snippets WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, [id], row_to_snippet)
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("snippet {}", id)))
}

pub fn list_all(conn: &Connection) -> Result<Vec<Snippet>, EngineError> {
    let sql = format!(
        "SELECT {} FROM snippets ORDER BY created_at DESC, id",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_snippet)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Write the snippet body to `target` (guarded) and mark it installed.
pub fn install(
    store: &Store,
    conn: &Connection,
    id: &str,
    target: &Path,
) -> Result<Snippet, EngineError> {
    let mut snippet = get(conn, id)?;
    store.assert_write_safe(target)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(EngineError::Io)?;
    }
    // Temp-write plus rename keeps partially written snippets invisible.
    let tmp = target.with_extension("tmp");
    fs::write(&tmp, &snippet.body).map_err(EngineError::Io)?;
    fs::rename(&tmp, target).map_err(EngineError::Io)?;

    snippet.installed = true;
    snippet.installed_path = Some(target.to_string_lossy().to_string());
    snippet.updated_at = time::now_epoch_z();
    upsert(conn, &snippet)?;
    Ok(snippet)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "snippets", about = "Installable code fragments")]
pub struct SnippetsCli {
    #[clap(subcommand)]
    pub command: SnippetsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SnippetsCommand {
    /// List snippets with install state
    List,
    /// Show one snippet as JSON
    Show {
        #[clap(long)]
        id: String,
    },
}

pub fn run_snippets_cli(store: &Store, cli: SnippetsCli) -> Result<(), EngineError> {
    let conn = crate::core::db::open_store_db(store)?;
    match cli.command {
        SnippetsCommand::List => {
            for snippet in list_all(&conn)? {
                println!(
                    "  {}  {}  installed={}  {}",
                    snippet.id, snippet.completion_trigger, snippet.installed, snippet.title
                );
            }
        }
        SnippetsCommand::Show { id } => {
            let snippet = get(&conn, &id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&snippet)
                    .map_err(|e| EngineError::Schema(e.to_string()))?
            );
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "snippets",
        "version": "1.0.0",
        "description": "Installable code fragments with provenance and install state",
        "commands": [
            { "name": "list", "parameters": [] },
            { "name": "show", "parameters": ["id"] }
        ],
        "storage": ["autosnippet.db#snippets"]
    })
}
