//! Candidate subsystem: proposed knowledge units awaiting human review.
//!
//! Candidates enter through ingesters (`bootstrap-scan`, `mcp`, `manual`,
//! `cursor-scan`, ...), pass review, and are either rejected or approved and
//! later applied, at which point `applied_recipe_id` points to the recipe
//! created from them.

use crate::core::error::EngineError;
use crate::core::repo::{self, Page};
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CANDIDATE_ID_PREFIX: &str = "cnd";

/// Declared edges of the candidate status machine. Any transition outside
/// this set fails with `Conflict`.
const STATUS_EDGES: &[(&str, &str)] = &[
    ("pending", "approved"),
    ("pending", "rejected"),
    ("approved", "applied"),
    ("approved", "rejected"),
];

pub const VALID_SOURCES: &[&str] = &["bootstrap-scan", "mcp", "manual", "cursor-scan"];

/// One append-only entry in a status history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub from: String,
    pub to: String,
    pub actor: String,
    pub ts: String,
    #[serde(default)]
    pub reason: String,
}

/// A proposed knowledge unit awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub category: String,
    pub source: String,
    #[serde(default)]
    pub reasoning: JsonValue,
    pub status: String,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    #[serde(default)]
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub approved_at: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub rejected_by: Option<String>,
    #[serde(default)]
    pub applied_recipe_id: Option<String>,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Parameters for creating a candidate.
#[derive(Debug, Clone)]
pub struct NewCandidate<'a> {
    pub code: &'a str,
    pub language: &'a str,
    pub category: &'a str,
    pub source: &'a str,
    pub reasoning: JsonValue,
    pub created_by: &'a str,
    pub metadata: JsonValue,
}

impl Candidate {
    pub fn create(args: NewCandidate<'_>) -> Result<Candidate, EngineError> {
        if args.code.trim().is_empty() {
            return Err(EngineError::Validation(
                "candidate code must not be empty".to_string(),
            ));
        }
        let language = args.language.trim().to_lowercase();
        if language.is_empty() || !language.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EngineError::Validation(format!(
                "invalid language tag '{}'",
                args.language
            )));
        }
        let now = time::now_epoch_z();
        Ok(Candidate {
            id: crate::core::paths::new_id(CANDIDATE_ID_PREFIX),
            code: args.code.to_string(),
            language,
            category: args.category.to_string(),
            source: args.source.to_string(),
            reasoning: args.reasoning,
            status: "pending".to_string(),
            status_history: Vec::new(),
            created_by: args.created_by.to_string(),
            created_at: now.clone(),
            updated_at: now,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            rejected_by: None,
            applied_recipe_id: None,
            metadata: args.metadata,
        })
    }

    /// Whether the status machine allows `from → to`.
    pub fn transition_allowed(from: &str, to: &str) -> bool {
        STATUS_EDGES.iter().any(|(f, t)| *f == from && *t == to)
    }

    /// Apply a status transition, appending a history entry. Illegal
    /// transitions fail without mutating the entity.
    pub fn transition(
        &mut self,
        to: &str,
        actor: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        if !Self::transition_allowed(&self.status, to) {
            return Err(EngineError::Conflict(format!(
                "InvalidStateTransition: candidate {} cannot move {} -> {}",
                self.id, self.status, to
            )));
        }
        let now = time::now_epoch_z();
        self.status_history.push(StatusChange {
            from: self.status.clone(),
            to: to.to_string(),
            actor: actor.to_string(),
            ts: now.clone(),
            reason: reason.to_string(),
        });
        match to {
            "approved" => {
                self.approved_by = Some(actor.to_string());
                self.approved_at = Some(now.clone());
            }
            "rejected" => {
                self.rejected_by = Some(actor.to_string());
                self.rejection_reason = Some(reason.to_string());
            }
            _ => {}
        }
        self.status = to.to_string();
        self.updated_at = now;
        Ok(())
    }
}

// --- Repository ---

const SELECT_COLUMNS: &str = "id, code, language, category, source, reasoning_json, status,
    status_history_json, created_by, created_at, updated_at, approved_by, approved_at,
    rejection_reason, rejected_by, applied_recipe_id, metadata_json";

fn row_to_candidate(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candidate> {
    let reasoning_raw: String = row.get(5)?;
    let history_raw: String = row.get(7)?;
    let metadata_raw: String = row.get(16)?;
    Ok(Candidate {
        id: row.get(0)?,
        code: row.get(1)?,
        language: row.get(2)?,
        category: row.get(3)?,
        source: row.get(4)?,
        reasoning: serde_json::from_str(&reasoning_raw).unwrap_or(JsonValue::Null),
        status: row.get(6)?,
        status_history: serde_json::from_str(&history_raw).unwrap_or_default(),
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        approved_by: row.get(11)?,
        approved_at: row.get(12)?,
        rejection_reason: row.get(13)?,
        rejected_by: row.get(14)?,
        applied_recipe_id: row.get(15)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(JsonValue::Null),
    })
}

pub fn insert(conn: &Connection, candidate: &Candidate) -> Result<(), EngineError> {
    let history = serde_json::to_string(&candidate.status_history)
        .map_err(|e| EngineError::Schema(format!("status history encode: {}", e)))?;
    conn.execute(
        "INSERT INTO candidates(id, code, language, category, source, reasoning_json, status,
             status_history_json, created_by, created_at, updated_at, approved_by, approved_at,
             rejection_reason, rejected_by, applied_recipe_id, metadata_json)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            candidate.id,
            candidate.code,
            candidate.language,
            candidate.category,
            candidate.source,
            candidate.reasoning.to_string(),
            candidate.status,
            history,
            candidate.created_by,
            candidate.created_at,
            candidate.updated_at,
            candidate.approved_by,
            candidate.approved_at,
            candidate.rejection_reason,
            candidate.rejected_by,
            candidate.applied_recipe_id,
            candidate.metadata.to_string(),
        ],
    )
    .map_err(|e| EngineError::from_storage(e, &format!("candidate {}", candidate.id)))?;
    Ok(())
}

pub fn update(conn: &Connection, candidate: &Candidate) -> Result<(), EngineError> {
    let history = serde_json::to_string(&candidate.status_history)
        .map_err(|e| EngineError::Schema(format!("status history encode: {}", e)))?;
    let changed = conn.execute(
        "UPDATE candidates SET code = ?2, language = ?3, category = ?4, source = ?5,
             reasoning_json = ?6, status = ?7, status_history_json = ?8, updated_at = ?9,
             approved_by = ?10, approved_at = ?11, rejection_reason = ?12, rejected_by = ?13,
             applied_recipe_id = ?14, metadata_json = ?15
         WHERE id = ?1",
        params![
            candidate.id,
            candidate.code,
            candidate.language,
            candidate.category,
            candidate.source,
            candidate.reasoning.to_string(),
            candidate.status,
            history,
            candidate.updated_at,
            candidate.approved_by,
            candidate.approved_at,
            candidate.rejection_reason,
            candidate.rejected_by,
            candidate.applied_recipe_id,
            candidate.metadata.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(EngineError::NotFound(format!(
            "candidate {}",
            candidate.id
        )));
    }
    Ok(())
}

pub fn get(conn: &Connection, id: &str) -> Result<Candidate, EngineError> {
    let sql = format!("SELECT {} FROM candidates WHERE id = ?1", SELECT_COLUMNS);
    conn.query_row(&sql, [id], row_to_candidate)
        .optional()?
        .ok_or_else(|| EngineError::NotFound(format!("candidate {}", id)))
}

/// Paginated listing with optional status filter, newest first.
pub fn list(
    conn: &Connection,
    status: Option<&str>,
    page: u32,
    page_size: u32,
) -> Result<Page<Candidate>, EngineError> {
    let (where_clause, filter): (&str, Vec<String>) = match status {
        Some(s) => ("WHERE status = ?1", vec![s.to_string()]),
        None => ("", vec![]),
    };
    let total: u64 = {
        let sql = format!("SELECT COUNT(*) FROM candidates {}", where_clause);
        let mut stmt = conn.prepare(&sql)?;
        stmt.query_row(rusqlite::params_from_iter(filter.iter()), |r| {
            r.get::<_, i64>(0)
        })? as u64
    };
    let sql = format!(
        "SELECT {} FROM candidates {} ORDER BY created_at DESC, id LIMIT {} OFFSET {}",
        SELECT_COLUMNS,
        where_clause,
        page_size.max(1),
        Page::<Candidate>::offset(page, page_size)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(filter.iter()), row_to_candidate)?;
    let mut data = Vec::new();
    for row in rows {
        data.push(row?);
    }
    Ok(Page::new(data, page, page_size, total))
}

pub fn find_by_status(conn: &Connection, status: &str) -> Result<Vec<Candidate>, EngineError> {
    select_where(conn, "status = ?1", &[status])
}

pub fn find_by_language(conn: &Connection, language: &str) -> Result<Vec<Candidate>, EngineError> {
    select_where(conn, "language = ?1", &[language])
}

pub fn find_by_created_by(
    conn: &Connection,
    created_by: &str,
) -> Result<Vec<Candidate>, EngineError> {
    select_where(conn, "created_by = ?1", &[created_by])
}

/// Keyword search over code, category, and metadata. Empty keyword returns
/// an empty set rather than the whole table.
pub fn search(conn: &Connection, keyword: &str) -> Result<Vec<Candidate>, EngineError> {
    if keyword.trim().is_empty() {
        return Ok(Vec::new());
    }
    let pattern = repo::contains_pattern(keyword);
    select_where(
        conn,
        "(code LIKE ?1 ESCAPE '\\' OR category LIKE ?1 ESCAPE '\\' OR metadata_json LIKE ?1 ESCAPE '\\')",
        &[&pattern],
    )
}

fn select_where(
    conn: &Connection,
    predicate: &str,
    args: &[&str],
) -> Result<Vec<Candidate>, EngineError> {
    let sql = format!(
        "SELECT {} FROM candidates WHERE {} ORDER BY created_at DESC, id",
        SELECT_COLUMNS, predicate
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_candidate)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Persist a reviewed transition: load, transition, write back.
pub fn apply_transition(
    conn: &Connection,
    id: &str,
    to: &str,
    actor: &str,
    reason: &str,
) -> Result<Candidate, EngineError> {
    let mut candidate = get(conn, id)?;
    candidate.transition(to, actor, reason)?;
    update(conn, &candidate)?;
    Ok(candidate)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "candidates", about = "Review queue for proposed knowledge units")]
pub struct CandidatesCli {
    #[clap(subcommand)]
    pub command: CandidatesCommand,
}

#[derive(Subcommand, Debug)]
pub enum CandidatesCommand {
    /// List candidates, optionally filtered by status
    List {
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value = "1")]
        page: u32,
        #[clap(long, default_value = "20")]
        page_size: u32,
    },
    /// Show one candidate as JSON
    Show {
        #[clap(long)]
        id: String,
    },
    /// Search candidates by keyword
    Search {
        #[clap(long)]
        query: String,
    },
}

pub fn run_candidates_cli(
    store: &crate::core::store::Store,
    cli: CandidatesCli,
) -> Result<(), EngineError> {
    let conn = crate::core::db::open_store_db(store)?;
    match cli.command {
        CandidatesCommand::List {
            status,
            page,
            page_size,
        } => {
            let result = list(&conn, status.as_deref(), page, page_size)?;
            println!(
                "candidates: page {}/{} total {}",
                result.page, result.pages.max(1), result.total
            );
            for candidate in result.data {
                println!(
                    "  {}  {}  {}  {}",
                    candidate.id, candidate.status, candidate.language, candidate.source
                );
            }
        }
        CandidatesCommand::Show { id } => {
            let candidate = get(&conn, &id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&candidate)
                    .map_err(|e| EngineError::Schema(e.to_string()))?
            );
        }
        CandidatesCommand::Search { query } => {
            for candidate in search(&conn, &query)? {
                println!("  {}  {}  {}", candidate.id, candidate.status, candidate.category);
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "candidates",
        "version": "1.0.0",
        "description": "Proposed knowledge units with a reviewed status lifecycle",
        "statuses": ["pending", "approved", "rejected", "applied"],
        "sources": VALID_SOURCES,
        "terminal": ["rejected", "applied"],
        "commands": [
            { "name": "list", "parameters": ["status", "page", "page_size"] },
            { "name": "show", "parameters": ["id"] },
            { "name": "search", "parameters": ["query"] }
        ],
        "storage": ["autosnippet.db#candidates"]
    })
}
