// Edit Log: append-only, version-ordered history per session.
//
// Entries are written in the same transaction as the session version bump,
// so for every retained entry `result_version` is a version the session
// actually reached. Pruning only ever removes a prefix by time, never a gap
// in the middle, because `applied_at` increases with `result_version`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use studio_collab_common::operation::EditOperation;
use studio_collab_common::types::Edit;

use super::{decode_json, decode_ts, decode_version, encode_ts, sql_version, SessionStore};
use crate::error::{CollabError, CollabResult};

const EDIT_COLUMNS: &str = "session_id, base_version, result_version, user_id, operation, applied_at";

/// Stateless operations on the `collab_edits` table.
pub struct EditLog;

impl EditLog {
    /// Append one accepted edit. Must run in the transaction that advanced
    /// the session to `result_version`.
    pub fn record(
        conn: &Connection,
        session_id: &str,
        base_version: u64,
        result_version: u64,
        operation: &EditOperation,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CollabResult<Edit> {
        if base_version.checked_add(1) != Some(result_version) {
            return Err(CollabError::invariant(
                session_id,
                format!("edit {base_version} -> {result_version} skips a version"),
            ));
        }

        let session = SessionStore::get_document_state(conn, session_id)?;
        if session.version != result_version {
            return Err(CollabError::invariant(
                session_id,
                format!(
                    "edit result {result_version} does not match session version {}",
                    session.version
                ),
            ));
        }

        if let Some(head) = Self::log_head(conn, session_id)? {
            if head != base_version {
                return Err(CollabError::invariant(
                    session_id,
                    format!("edit base {base_version} does not follow log head {head}"),
                ));
            }
        }

        let encoded = serde_json::to_string(operation).context("failed to encode edit operation")?;
        let inserted = conn
            .execute(
                "INSERT INTO collab_edits \
                 (session_id, base_version, result_version, user_id, operation, applied_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (session_id, result_version) DO NOTHING",
                params![
                    session_id,
                    sql_version(base_version)?,
                    sql_version(result_version)?,
                    user_id,
                    encoded,
                    encode_ts(now)
                ],
            )
            .context("failed to append edit")?;
        if inserted == 0 {
            return Err(CollabError::invariant(
                session_id,
                format!("edit log already holds result version {result_version}"),
            ));
        }

        Ok(Edit {
            session_id: session_id.to_owned(),
            base_version,
            result_version,
            user_id: user_id.to_owned(),
            operation: operation.clone(),
            applied_at: now,
        })
    }

    /// Retained edits with `result_version > known_version`, ascending.
    ///
    /// An empty or partial answer is not proof of anything on its own; the
    /// caller compares it with the session version to decide on a resync.
    pub fn get_since(
        conn: &Connection,
        session_id: &str,
        known_version: u64,
    ) -> CollabResult<Vec<Edit>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EDIT_COLUMNS} FROM collab_edits \
                 WHERE session_id = ?1 AND result_version > ?2 \
                 ORDER BY result_version ASC"
            ))
            .context("failed to prepare edits-since query")?;

        let rows = stmt
            .query_map(params![session_id, sql_version(known_version)?], row_to_edit)
            .context("failed to query edits since version")?;

        let edits = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to collect edits since version")?;
        Ok(edits)
    }

    /// Highest retained `result_version`, or `None` when nothing is retained.
    pub fn log_head(conn: &Connection, session_id: &str) -> CollabResult<Option<u64>> {
        let head: Option<i64> = conn
            .query_row(
                "SELECT MAX(result_version) FROM collab_edits WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read edit log head")?
            .flatten();

        head.map(|raw| decode_version(raw, 0))
            .transpose()
            .context("edit log head is negative")
            .map_err(CollabError::from)
    }

    pub fn count_for_session(conn: &Connection, session_id: &str) -> CollabResult<usize> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM collab_edits WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("failed to count session edits")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Drop edits applied before `older_than`, across all sessions.
    pub fn prune(conn: &Connection, older_than: DateTime<Utc>) -> CollabResult<usize> {
        let removed = conn
            .execute(
                "DELETE FROM collab_edits WHERE applied_at < ?1",
                params![encode_ts(older_than)],
            )
            .context("failed to prune edit log")?;
        Ok(removed)
    }
}

fn row_to_edit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edit> {
    let base_raw: i64 = row.get(1)?;
    let result_raw: i64 = row.get(2)?;
    let operation_raw: String = row.get(4)?;
    let applied_raw: String = row.get(5)?;

    Ok(Edit {
        session_id: row.get(0)?,
        base_version: decode_version(base_raw, 1)?,
        result_version: decode_version(result_raw, 2)?,
        user_id: row.get(3)?,
        operation: decode_json(&operation_raw, 4)?,
        applied_at: decode_ts(&applied_raw, 5)?,
    })
}
