//! Session tracking for multi-call tool interactions.
//!
//! Sessions are database-only; they are never mirrored into the markdown
//! corpus. A session correlates several protocol calls from one actor.

use crate::core::error::EngineError;
use crate::core::time;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const SESSION_ID_PREFIX: &str = "ses";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub scope: String,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub metadata: JsonValue,
    #[serde(default)]
    pub actor: String,
    pub created_at: String,
    pub last_active_at: String,
    #[serde(default)]
    pub expired_at: Option<String>,
}

pub fn open(
    conn: &Connection,
    scope: &str,
    scope_id: &str,
    actor: &str,
    context: &str,
) -> Result<Session, EngineError> {
    let now = time::now_epoch_z();
    let session = Session {
        id: crate::core::paths::new_id(SESSION_ID_PREFIX),
        scope: scope.to_string(),
        scope_id: scope_id.to_string(),
        context: context.to_string(),
        metadata: JsonValue::Null,
        actor: actor.to_string(),
        created_at: now.clone(),
        last_active_at: now,
        expired_at: None,
    };
    conn.execute(
        "INSERT INTO sessions(id, scope, scope_id, context, metadata_json, actor, created_at,
             last_active_at, expired_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
        params![
            session.id,
            session.scope,
            session.scope_id,
            session.context,
            session.metadata.to_string(),
            session.actor,
            session.created_at,
            session.last_active_at,
        ],
    )?;
    Ok(session)
}

pub fn get(conn: &Connection, id: &str) -> Result<Session, EngineError> {
    conn.query_row(
        "SELECT id, scope, scope_id, context, metadata_json, actor, created_at, last_active_at,
                expired_at
         FROM sessions WHERE id = ?1",
        [id],
        |row| {
            let metadata_raw: String = row.get(4)?;
            Ok(Session {
                id: row.get(0)?,
                scope: row.get(1)?,
                scope_id: row.get(2)?,
                context: row.get(3)?,
                metadata: serde_json::from_str(&metadata_raw).unwrap_or(JsonValue::Null),
                actor: row.get(5)?,
                created_at: row.get(6)?,
                last_active_at: row.get(7)?,
                expired_at: row.get(8)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| EngineError::NotFound(format!("session {}", id)))
}

/// Record activity on a live session. Touching an expired session fails.
pub fn touch(conn: &Connection, id: &str) -> Result<(), EngineError> {
    let session = get(conn, id)?;
    if session.expired_at.is_some() {
        return Err(EngineError::Conflict(format!("session {} is expired", id)));
    }
    conn.execute(
        "UPDATE sessions SET last_active_at = ?2 WHERE id = ?1",
        params![id, time::now_epoch_z()],
    )?;
    Ok(())
}

/// Mark sessions idle past `ttl_secs` as expired; returns how many.
pub fn expire_idle(conn: &Connection, ttl_secs: u64) -> Result<usize, EngineError> {
    let cutoff = time::now_epoch_secs().saturating_sub(ttl_secs);
    let mut stmt = conn.prepare(
        "SELECT id, last_active_at FROM sessions WHERE expired_at IS NULL",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut expired = 0usize;
    let now = time::now_epoch_z();
    for row in rows {
        let (id, last_active) = row?;
        let last_secs = time::parse_epoch_z(&last_active).unwrap_or(0);
        if last_secs <= cutoff {
            conn.execute(
                "UPDATE sessions SET expired_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
            expired += 1;
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db;
    use tempfile::tempdir;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let tmp = tempdir().expect("tempdir");
        let mut conn = db::db_connect(&tmp.path().join("engine.db")).expect("connect");
        crate::core::migration::run_migrations(&mut conn).expect("migrate");
        (tmp, conn)
    }

    #[test]
    fn test_open_touch_round_trip() {
        let (_tmp, conn) = test_conn();
        let session = open(&conn, "tool", "recipes.search", "agent-1", "{}").expect("open");
        touch(&conn, &session.id).expect("touch");
        let loaded = get(&conn, &session.id).expect("get");
        assert_eq!(loaded.actor, "agent-1");
        assert!(loaded.expired_at.is_none());
    }

    #[test]
    fn test_expire_idle_marks_and_blocks_touch() {
        let (_tmp, conn) = test_conn();
        let session = open(&conn, "tool", "", "agent-1", "").expect("open");
        // Backdate activity far enough for a zero-ttl sweep.
        conn.execute(
            "UPDATE sessions SET last_active_at = '1000Z' WHERE id = ?1",
            [&session.id],
        )
        .expect("backdate");

        let count = expire_idle(&conn, 60).expect("sweep");
        assert_eq!(count, 1);
        let err = touch(&conn, &session.id).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
