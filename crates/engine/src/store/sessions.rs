// Session Store: the canonical snapshot and version counter per document.
//
// `apply_edit` is the only statement that advances `version`, and it does so
// with a conditional update keyed on the version the edit was computed
// against. Run it inside an IMMEDIATE transaction so the read of the current
// state and the update are one atomic step across connections.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use studio_collab_common::operation::EditOperation;
use studio_collab_common::types::Session;
use tracing::debug;
use uuid::Uuid;

use super::{decode_json, decode_ts, decode_version, encode_ts, sql_version};
use crate::error::{CollabError, CollabResult};

const SESSION_COLUMNS: &str = "session_id, document_id, version, document_state, flushed_version, \
                               created_at, last_activity_at";

/// Stateless operations on the `collab_sessions` table.
pub struct SessionStore;

impl SessionStore {
    pub fn get(conn: &Connection, session_id: &str) -> CollabResult<Option<Session>> {
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM collab_sessions WHERE session_id = ?1"),
                params![session_id],
                row_to_session,
            )
            .optional()
            .context("failed to query collab session")?;
        Ok(session)
    }

    pub fn find_by_document(conn: &Connection, document_id: &str) -> CollabResult<Option<Session>> {
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM collab_sessions WHERE document_id = ?1"),
                params![document_id],
                row_to_session,
            )
            .optional()
            .context("failed to query collab session by document")?;
        Ok(session)
    }

    /// Read-only fetch used for full resync.
    pub fn get_document_state(conn: &Connection, session_id: &str) -> CollabResult<Session> {
        Self::get(conn, session_id)?.ok_or_else(|| CollabError::session_not_found(session_id))
    }

    pub fn exists(conn: &Connection, session_id: &str) -> CollabResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collab_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check collab session existence")?;
        Ok(found.is_some())
    }

    /// Return the session for `document_id`, creating it at version 0 from
    /// `load_content` if none exists.
    ///
    /// Concurrent callers converge on one row: the insert is a no-op when the
    /// unique `document_id` is already taken, and everyone re-reads the
    /// winner. The returned flag is true only for the caller that inserted.
    pub fn get_or_create<F>(
        conn: &Connection,
        document_id: &str,
        now: DateTime<Utc>,
        load_content: F,
    ) -> CollabResult<(Session, bool)>
    where
        F: FnOnce() -> CollabResult<Value>,
    {
        if let Some(existing) = Self::find_by_document(conn, document_id)? {
            return Ok((existing, false));
        }

        let seed = load_content()?;
        let session_id = Uuid::new_v4().to_string();
        let state = serde_json::to_string(&seed).context("failed to encode document state")?;
        let ts = encode_ts(now);

        let inserted = conn
            .execute(
                "INSERT INTO collab_sessions \
                 (session_id, document_id, version, document_state, flushed_version, \
                  created_at, last_activity_at) \
                 VALUES (?1, ?2, 0, ?3, 0, ?4, ?4) \
                 ON CONFLICT (document_id) DO NOTHING",
                params![session_id, document_id, state, ts],
            )
            .context("failed to insert collab session")?;

        let session = Self::find_by_document(conn, document_id)?.ok_or_else(|| {
            anyhow::anyhow!("collab session for document `{document_id}` vanished after insert")
        })?;

        if inserted == 0 {
            debug!(document_id, session_id = %session.id, "lost session creation race; reusing");
        }
        Ok((session, inserted > 0))
    }

    /// Apply `operation` if `base_version` is still current.
    ///
    /// Returns the updated session (`version = base_version + 1`), or
    /// `VersionConflict` carrying the authoritative session.
    pub fn apply_edit(
        conn: &Connection,
        session_id: &str,
        base_version: u64,
        operation: &EditOperation,
        now: DateTime<Utc>,
    ) -> CollabResult<Session> {
        let current = Self::get_document_state(conn, session_id)?;
        if current.version != base_version {
            return Err(CollabError::VersionConflict { session: Box::new(current) });
        }

        let mut next_state = current.document_state;
        operation.apply(&mut next_state)?;
        let encoded =
            serde_json::to_string(&next_state).context("failed to encode document state")?;

        let changed = conn
            .execute(
                "UPDATE collab_sessions \
                 SET version = version + 1, document_state = ?1, last_activity_at = ?2 \
                 WHERE session_id = ?3 AND version = ?4",
                params![encoded, encode_ts(now), session_id, sql_version(base_version)?],
            )
            .context("failed to apply edit to collab session")?;

        let updated = Self::get_document_state(conn, session_id)?;
        if changed == 0 {
            return Err(CollabError::VersionConflict { session: Box::new(updated) });
        }
        Ok(updated)
    }

    /// Bump `last_activity_at` without touching the version.
    pub fn touch_activity(conn: &Connection, session_id: &str, now: DateTime<Utc>) -> CollabResult<()> {
        let changed = conn
            .execute(
                "UPDATE collab_sessions SET last_activity_at = ?1 \
                 WHERE session_id = ?2 AND last_activity_at < ?1",
                params![encode_ts(now), session_id],
            )
            .context("failed to touch collab session")?;
        if changed == 0 && !Self::exists(conn, session_id)? {
            return Err(CollabError::session_not_found(session_id));
        }
        Ok(())
    }

    /// Record that `version` has been saved to the content store. Never lowers
    /// the flushed version.
    pub fn mark_flushed(conn: &Connection, session_id: &str, version: u64) -> CollabResult<()> {
        let changed = conn
            .execute(
                "UPDATE collab_sessions SET flushed_version = MAX(flushed_version, ?1) \
                 WHERE session_id = ?2",
                params![sql_version(version)?, session_id],
            )
            .context("failed to mark collab session flushed")?;
        if changed == 0 {
            return Err(CollabError::session_not_found(session_id));
        }
        Ok(())
    }

    /// Sessions with no participants whose last activity is before `cutoff`.
    pub fn list_reclaimable(conn: &Connection, cutoff: DateTime<Utc>) -> CollabResult<Vec<Session>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM collab_sessions AS s \
                 WHERE s.last_activity_at < ?1 \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM collab_participants AS p WHERE p.session_id = s.session_id \
                   ) \
                 ORDER BY s.last_activity_at ASC"
            ))
            .context("failed to prepare reclaimable sessions query")?;

        let rows = stmt
            .query_map(params![encode_ts(cutoff)], row_to_session)
            .context("failed to query reclaimable sessions")?;

        let sessions = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to collect reclaimable sessions")?;
        Ok(sessions)
    }

    /// Delete the session only if it is still reclaimable at delete time:
    /// idle past `cutoff`, no participants, and nothing left unflushed.
    /// Edits and any presence rows go with it through `ON DELETE CASCADE`.
    pub fn delete_if_reclaimable(
        conn: &Connection,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> CollabResult<bool> {
        let removed = conn
            .execute(
                "DELETE FROM collab_sessions \
                 WHERE session_id = ?1 \
                   AND last_activity_at < ?2 \
                   AND flushed_version >= version \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM collab_participants WHERE session_id = ?1 \
                   )",
                params![session_id, encode_ts(cutoff)],
            )
            .context("failed to delete reclaimable collab session")?;
        Ok(removed > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let version_raw: i64 = row.get(2)?;
    let state_raw: String = row.get(3)?;
    let flushed_raw: i64 = row.get(4)?;
    let created_raw: String = row.get(5)?;
    let activity_raw: String = row.get(6)?;

    Ok(Session {
        id: row.get(0)?,
        document_id: row.get(1)?,
        version: decode_version(version_raw, 2)?,
        document_state: decode_json(&state_raw, 3)?,
        flushed_version: decode_version(flushed_raw, 4)?,
        created_at: decode_ts(&created_raw, 5)?,
        last_activity_at: decode_ts(&activity_raw, 6)?,
    })
}
