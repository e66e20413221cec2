use std::path::Path;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

use super::Session;
use crate::models::Turn;
use crate::utils::time::now_utc_rfc3339;

pub const JOURNAL_SCHEMA_VERSION: &str = "tabletalk.journal.v1";
pub const JOURNAL_META_TABLE: &str = "journal_meta";

const CREATE_SESSIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT NOT NULL PRIMARY KEY,
    platform TEXT,
    turn_counter INTEGER NOT NULL DEFAULT 0,
    created_at_utc TEXT NOT NULL,
    updated_at_utc TEXT NOT NULL
);
"#;

const CREATE_TURNS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS turns (
    session_id TEXT NOT NULL REFERENCES sessions (session_id) ON DELETE CASCADE,
    sequence INTEGER NOT NULL,
    status TEXT NOT NULL,
    question TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at_utc TEXT NOT NULL,
    PRIMARY KEY (session_id, sequence),
    CHECK (status IN ('succeeded', 'planner_exhausted', 'validation_rejected', 'execution_failed'))
);
"#;

const CREATE_META_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS journal_meta (
    schema_version TEXT NOT NULL,
    applied_at_utc TEXT NOT NULL
);
"#;

/// Write-through SQLite mirror of the session store so transcripts survive restarts.
#[derive(Debug)]
pub struct SessionJournal {
    connection: Connection,
}

impl SessionJournal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create journal parent directory: {}",
                    parent.display()
                )
            })?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open session journal: {}", path.display()))?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory session journal")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable journal foreign keys")?;
        let journal = Self { connection };
        journal.ensure_schema()?;
        Ok(journal)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.connection
            .execute_batch(
                &[
                    CREATE_SESSIONS_TABLE_SQL,
                    CREATE_TURNS_TABLE_SQL,
                    CREATE_META_TABLE_SQL,
                ]
                .join("\n"),
            )
            .context("failed to create journal schema")?;

        let exists = self
            .connection
            .query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {JOURNAL_META_TABLE} WHERE schema_version = ?1 LIMIT 1)"
                ),
                [JOURNAL_SCHEMA_VERSION],
                |row| row.get::<usize, i64>(0),
            )
            .context("failed to query journal schema version")?;
        if exists != 0 {
            return Ok(());
        }

        self.connection
            .execute(
                &format!(
                    "INSERT INTO {JOURNAL_META_TABLE} (schema_version, applied_at_utc) VALUES (?1, ?2)"
                ),
                params![JOURNAL_SCHEMA_VERSION, now_utc_rfc3339()],
            )
            .context("failed to write journal schema meta row")?;
        Ok(())
    }

    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO sessions (session_id, platform, turn_counter, created_at_utc, updated_at_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (session_id) DO UPDATE SET
                     platform = excluded.platform,
                     turn_counter = excluded.turn_counter,
                     updated_at_utc = excluded.updated_at_utc",
                params![
                    session.id,
                    session.platform,
                    to_i64(session.turn_counter, "turn_counter")?,
                    session.created_at_utc,
                    now_utc_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to upsert session `{}`", session.id))?;
        Ok(())
    }

    /// Records a finalized turn together with the session's advanced counter.
    pub fn append_turn(&mut self, session: &Session, turn: &Turn) -> Result<()> {
        let payload =
            serde_json::to_string(turn).context("failed to encode turn journal payload")?;
        let tx = self
            .connection
            .transaction()
            .context("failed to open journal transaction")?;
        tx.execute(
            "UPDATE sessions SET turn_counter = ?2, updated_at_utc = ?3 WHERE session_id = ?1",
            params![
                session.id,
                to_i64(session.turn_counter, "turn_counter")?,
                now_utc_rfc3339()
            ],
        )
        .with_context(|| format!("failed to advance turn counter for `{}`", session.id))?;
        tx.execute(
            "INSERT INTO turns (session_id, sequence, status, question, payload_json, created_at_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                to_i64(turn.sequence, "sequence")?,
                turn.status.as_str(),
                turn.question,
                payload,
                turn.created_at_utc,
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert turn {} for session `{}`",
                turn.sequence, session.id
            )
        })?;
        tx.commit().context("failed to commit journal transaction")?;
        Ok(())
    }

    pub fn clear_turns(&self, session_id: &str) -> Result<usize> {
        self.connection
            .execute("DELETE FROM turns WHERE session_id = ?1", [session_id])
            .with_context(|| format!("failed to clear turns for `{session_id}`"))
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.clear_turns(session_id)?;
        let deleted = self
            .connection
            .execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])
            .with_context(|| format!("failed to delete session `{session_id}`"))?;
        Ok(deleted > 0)
    }

    pub fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let header = self
            .connection
            .query_row(
                "SELECT session_id, platform, turn_counter, created_at_utc FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| {
                    Ok((
                        row.get::<usize, String>(0)?,
                        row.get::<usize, Option<String>>(1)?,
                        row.get::<usize, i64>(2)?,
                        row.get::<usize, String>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read session `{session_id}`"))?;
        let Some((id, platform, turn_counter, created_at_utc)) = header else {
            return Ok(None);
        };

        let turns = self.load_turns(&id)?;
        Ok(Some(Session {
            id,
            platform,
            turn_counter: u64::try_from(turn_counter)
                .map_err(|_| anyhow!("turn_counter for `{session_id}` is negative"))?,
            turns,
            created_at_utc,
        }))
    }

    pub fn session_ids(&self) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT session_id FROM sessions ORDER BY created_at_utc, session_id")
            .context("failed to prepare session listing")?;
        let rows = statement
            .query_map([], |row| row.get::<usize, String>(0))
            .context("failed to list journal sessions")?;
        rows.map(|row| row.context("failed to decode session id"))
            .collect()
    }

    fn load_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT payload_json FROM turns WHERE session_id = ?1 ORDER BY sequence ASC",
            )
            .context("failed to prepare turn query")?;
        let rows = statement
            .query_map([session_id], |row| row.get::<usize, String>(0))
            .with_context(|| format!("failed to read turns for `{session_id}`"))?;

        let mut turns = Vec::new();
        for row in rows {
            let payload = row.context("failed to decode turn row")?;
            let turn = serde_json::from_str::<Turn>(&payload)
                .with_context(|| format!("failed to decode turn payload for `{session_id}`"))?;
            turns.push(turn);
        }
        Ok(turns)
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{field} exceeds sqlite INTEGER range"))
}
