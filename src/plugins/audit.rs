//! Audit log and guard-violation records.
//!
//! Audit rows are append-only and never updated; one row per gateway
//! dispatch. Guard violations record the outcome of running active rule
//! guards against submitted file content, one record per check invocation.

use crate::core::error::EngineError;
use crate::core::time;
use crate::plugins::recipes;
use clap::{Parser, Subcommand};
use regex::Regex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const AUDIT_ID_PREFIX: &str = "aud";
pub const VIOLATION_ID_PREFIX: &str = "vio";

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub ts: String,
    pub actor: String,
    #[serde(default)]
    pub actor_context: String,
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub operation_data: JsonValue,
    /// `allow`, `deny`, or `error`.
    pub result: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

/// Append one audit row. Callers must treat failures as log-and-suppress;
/// an audit write error never fails the audited operation.
pub fn append(conn: &Connection, entry: &AuditLog) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO audit_logs(id, ts, actor, actor_context, action, resource, operation_data,
             result, error_message, duration_ms)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id,
            entry.ts,
            entry.actor,
            entry.actor_context,
            entry.action,
            entry.resource,
            entry.operation_data.to_string(),
            entry.result,
            entry.error_message,
            entry.duration_ms as i64,
        ],
    )?;
    Ok(())
}

pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<AuditLog>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, actor, actor_context, action, resource, operation_data, result,
                error_message, duration_ms
         FROM audit_logs ORDER BY ts DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        let operation_raw: String = row.get(6)?;
        Ok(AuditLog {
            id: row.get(0)?,
            ts: row.get(1)?,
            actor: row.get(2)?,
            actor_context: row.get(3)?,
            action: row.get(4)?,
            resource: row.get(5)?,
            operation_data: serde_json::from_str(&operation_raw).unwrap_or(JsonValue::Null),
            result: row.get(7)?,
            error_message: row.get(8)?,
            duration_ms: row.get::<_, i64>(9)? as u64,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn find_by_action(conn: &Connection, action: &str) -> Result<Vec<AuditLog>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, actor, actor_context, action, resource, operation_data, result,
                error_message, duration_ms
         FROM audit_logs WHERE action = ?1 ORDER BY ts DESC, id DESC",
    )?;
    let rows = stmt.query_map([action], |row| {
        let operation_raw: String = row.get(6)?;
        Ok(AuditLog {
            id: row.get(0)?,
            ts: row.get(1)?,
            actor: row.get(2)?,
            actor_context: row.get(3)?,
            action: row.get(4)?,
            resource: row.get(5)?,
            operation_data: serde_json::from_str(&operation_raw).unwrap_or(JsonValue::Null),
            result: row.get(7)?,
            error_message: row.get(8)?,
            duration_ms: row.get::<_, i64>(9)? as u64,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- Guard checks ---

/// One matched guard inside a check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardHit {
    pub recipe_id: String,
    pub pattern: String,
    pub severity: String,
    pub message: String,
    pub line: usize,
}

/// One record per check invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardViolation {
    pub id: String,
    pub file_path: String,
    pub triggered_at: String,
    pub violation_count: usize,
    pub summary: String,
    pub violations: Vec<GuardHit>,
    pub created_at: String,
}

/// Outcome of a guard check: hits, advisory suggestions, and a score in
/// [0, 100] that drops with each hit (errors weigh double).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardCheckReport {
    pub violations: Vec<GuardHit>,
    pub suggestions: Vec<String>,
    pub score: u32,
}

/// Run the guards of every active rule recipe against `content`.
///
/// Guard patterns that fail to compile are skipped; a bad pattern in one
/// recipe must not block checks driven by the rest.
pub fn check_guards(
    conn: &Connection,
    content: &str,
    file_path: &str,
    language: Option<&str>,
) -> Result<GuardCheckReport, EngineError> {
    let guarded = recipes::find_with_guards(conn, language)?;
    let mut hits = Vec::new();
    let mut suggestions = Vec::new();

    for recipe in &guarded {
        for guard in &recipe.constraints.guards {
            let Ok(re) = Regex::new(&guard.pattern) else {
                continue;
            };
            for (line_index, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    hits.push(GuardHit {
                        recipe_id: recipe.id.clone(),
                        pattern: guard.pattern.clone(),
                        severity: guard.severity.clone(),
                        message: guard.message.clone(),
                        line: line_index + 1,
                    });
                }
            }
        }
        if !recipe.usage_guide_en.trim().is_empty() {
            suggestions.push(format!("{}: {}", recipe.title, recipe.usage_guide_en));
        }
    }

    let penalty: u32 = hits
        .iter()
        .map(|h| if h.severity == "error" { 20 } else { 10 })
        .sum();
    let score = 100u32.saturating_sub(penalty);

    let record = GuardViolation {
        id: crate::core::paths::new_id(VIOLATION_ID_PREFIX),
        file_path: file_path.to_string(),
        triggered_at: time::now_epoch_z(),
        violation_count: hits.len(),
        summary: if hits.is_empty() {
            "clean".to_string()
        } else {
            format!("{} guard hit(s)", hits.len())
        },
        violations: hits.clone(),
        created_at: time::now_epoch_z(),
    };
    record_violation(conn, &record)?;

    Ok(GuardCheckReport {
        violations: hits,
        suggestions,
        score,
    })
}

pub fn record_violation(conn: &Connection, record: &GuardViolation) -> Result<(), EngineError> {
    let violations = serde_json::to_string(&record.violations)
        .map_err(|e| EngineError::Schema(format!("violations encode: {}", e)))?;
    conn.execute(
        "INSERT INTO guard_violations(id, file_path, triggered_at, violation_count, summary,
             violations_json, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id,
            record.file_path,
            record.triggered_at,
            record.violation_count as i64,
            record.summary,
            violations,
            record.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_violations(conn: &Connection, limit: usize) -> Result<Vec<GuardViolation>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, triggered_at, violation_count, summary, violations_json, created_at
         FROM guard_violations ORDER BY created_at DESC, id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        let violations_raw: String = row.get(5)?;
        Ok(GuardViolation {
            id: row.get(0)?,
            file_path: row.get(1)?,
            triggered_at: row.get(2)?,
            violation_count: row.get::<_, i64>(3)? as usize,
            summary: row.get(4)?,
            violations: serde_json::from_str(&violations_raw).unwrap_or_default(),
            created_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "audit", about = "Audit log and guard checks")]
pub struct AuditCli {
    #[clap(subcommand)]
    pub command: AuditCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Show recent audit rows
    Log {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// Check a file against active guard rules
    Check {
        #[clap(long)]
        file: std::path::PathBuf,
        #[clap(long)]
        language: Option<String>,
    },
    /// Show recent guard violation records
    Violations {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
}

pub fn run_audit_cli(
    store: &crate::core::store::Store,
    cli: AuditCli,
) -> Result<(), EngineError> {
    let conn = crate::core::db::open_store_db(store)?;
    match cli.command {
        AuditCommand::Log { limit } => {
            for entry in list_recent(&conn, limit)? {
                println!(
                    "  {}  {}  {}  {}  {}ms",
                    entry.ts, entry.result, entry.actor, entry.action, entry.duration_ms
                );
            }
        }
        AuditCommand::Check { file, language } => {
            let content = std::fs::read_to_string(&file).map_err(EngineError::Io)?;
            let report = check_guards(
                &conn,
                &content,
                &file.to_string_lossy(),
                language.as_deref(),
            )?;
            println!("score: {}", report.score);
            for hit in &report.violations {
                println!(
                    "  {}:{}  [{}]  {}",
                    file.display(),
                    hit.line,
                    hit.severity,
                    hit.message
                );
            }
        }
        AuditCommand::Violations { limit } => {
            for record in list_violations(&conn, limit)? {
                println!(
                    "  {}  {}  {}  {}",
                    record.triggered_at, record.file_path, record.violation_count, record.summary
                );
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "audit",
        "version": "1.0.0",
        "description": "Append-only audit log plus guard-check reports",
        "results": ["allow", "deny", "error"],
        "commands": [
            { "name": "log", "parameters": ["limit"] },
            { "name": "check", "parameters": ["file", "language"] },
            { "name": "violations", "parameters": ["limit"] }
        ],
        "storage": ["autosnippet.db#audit_logs", "autosnippet.db#guard_violations"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db;
    use crate::plugins::recipes::{GuardRule, NewRecipe, Recipe, RecipeContent};
    use tempfile::tempdir;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let tmp = tempdir().expect("tempdir");
        let mut conn = db::db_connect(&tmp.path().join("engine.db")).expect("connect");
        crate::core::migration::run_migrations(&mut conn).expect("migrate");
        (tmp, conn)
    }

    #[test]
    fn test_append_and_list_audit_rows() {
        let (_tmp, conn) = test_conn();
        let entry = AuditLog {
            id: crate::core::paths::new_id(AUDIT_ID_PREFIX),
            ts: time::now_epoch_z(),
            actor: "developer_admin".to_string(),
            actor_context: String::new(),
            action: "create:recipe".to_string(),
            resource: "recipe".to_string(),
            operation_data: serde_json::json!({"title": "X"}),
            result: "allow".to_string(),
            error_message: None,
            duration_ms: 3,
        };
        append(&conn, &entry).expect("append");
        let rows = list_recent(&conn, 10).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].result, "allow");
        assert_eq!(rows[0].operation_data["title"], "X");
    }

    #[test]
    fn test_check_guards_scores_and_records() {
        let (_tmp, conn) = test_conn();
        let mut rule = Recipe::create(NewRecipe {
            title: "No force unwrap",
            language: "swift",
            category: "Utility",
            knowledge_type: "code-standard",
            kind: None,
            trigger: "@noforce",
            content: RecipeContent {
                pattern: "if let value = optional { ... }".to_string(),
                ..Default::default()
            },
            source_candidate_id: None,
            source_file: None,
        })
        .expect("recipe");
        rule.constraints.guards.push(GuardRule {
            pattern: r"\w+!".to_string(),
            severity: "error".to_string(),
            message: "force unwrap".to_string(),
        });
        rule.transition("active", "t", "").expect("activate");
        recipes::upsert(&conn, &rule).expect("upsert");

        let report = check_guards(
            &conn,
            "let a = value!\nlet b = other\n",
            "Sources/A.swift",
            Some("swift"),
        )
        .expect("check");
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].line, 1);
        assert_eq!(report.score, 80);

        let records = list_violations(&conn, 5).expect("violations");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].violation_count, 1);
    }

    #[test]
    fn test_check_guards_skips_bad_patterns() {
        let (_tmp, conn) = test_conn();
        let mut rule = Recipe::create(NewRecipe {
            title: "Broken guard",
            language: "swift",
            category: "",
            knowledge_type: "code-standard",
            kind: None,
            trigger: "",
            content: RecipeContent {
                rationale: "r".to_string(),
                ..Default::default()
            },
            source_candidate_id: None,
            source_file: None,
        })
        .expect("recipe");
        rule.constraints.guards.push(GuardRule {
            pattern: "([unclosed".to_string(),
            severity: "error".to_string(),
            message: "bad".to_string(),
        });
        rule.transition("active", "t", "").expect("activate");
        recipes::upsert(&conn, &rule).expect("upsert");

        let report = check_guards(&conn, "anything", "f.swift", None).expect("check");
        assert!(report.violations.is_empty());
        assert_eq!(report.score, 100);
    }
}
