// Participant Registry: presence and cursors.
//
// Rows are keyed by (session_id, user_id), so the only writer contending for
// a row is that user's own requests. Liveness is a read-time filter; the
// janitor deletes stale rows later, and listing is correct either way.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use studio_collab_common::types::{CursorPosition, Participant};

use super::{decode_ts, encode_ts, SessionStore};
use crate::error::{CollabError, CollabResult};

const MAX_DISPLAY_NAME_CHARS: usize = 80;

/// Cursor palette; picked per user by hash so it survives rejoins.
const PARTICIPANT_COLORS: &[&str] = &[
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
    "#7ec699", "#f08d49", "#8a9cf0", "#e68ab8",
];

const PARTICIPANT_COLUMNS: &str = "session_id, user_id, display_name, color, cursor_field_path, \
                                   cursor_offset, joined_at, last_seen_at";

/// Deterministic display color for `user_id`.
pub fn participant_color(user_id: &str) -> &'static str {
    let digest = Sha256::digest(user_id.as_bytes());
    let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    PARTICIPANT_COLORS[bucket % PARTICIPANT_COLORS.len()]
}

/// Stateless operations on the `collab_participants` table.
pub struct ParticipantRegistry;

impl ParticipantRegistry {
    /// Idempotent upsert. A rejoin refreshes `last_seen_at` and
    /// `display_name` but keeps `joined_at`, color and cursor.
    pub fn join(
        conn: &Connection,
        session_id: &str,
        user_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> CollabResult<Participant> {
        let display_name = normalize_display_name(display_name, user_id);
        // Checked first so a reclaimed session never gets orphaned presence.
        SessionStore::touch_activity(conn, session_id, now)?;

        let ts = encode_ts(now);
        conn.execute(
            "INSERT INTO collab_participants \
             (session_id, user_id, display_name, color, joined_at, last_seen_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT (session_id, user_id) DO UPDATE SET \
                 display_name = excluded.display_name, \
                 last_seen_at = MAX(collab_participants.last_seen_at, excluded.last_seen_at)",
            params![session_id, user_id, display_name, participant_color(user_id), ts],
        )
        .context("failed to upsert participant")?;

        Self::get(conn, session_id, user_id)?
            .ok_or_else(|| CollabError::participant_not_found(session_id, user_id))
    }

    pub fn get(
        conn: &Connection,
        session_id: &str,
        user_id: &str,
    ) -> CollabResult<Option<Participant>> {
        let participant = conn
            .query_row(
                &format!(
                    "SELECT {PARTICIPANT_COLUMNS} FROM collab_participants \
                     WHERE session_id = ?1 AND user_id = ?2"
                ),
                params![session_id, user_id],
                row_to_participant,
            )
            .optional()
            .context("failed to query participant")?;
        Ok(participant)
    }

    /// Refresh `last_seen_at` for the participant and activity for the session.
    pub fn heartbeat(
        conn: &Connection,
        session_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> CollabResult<()> {
        let changed = conn
            .execute(
                "UPDATE collab_participants SET last_seen_at = MAX(last_seen_at, ?1) \
                 WHERE session_id = ?2 AND user_id = ?3",
                params![encode_ts(now), session_id, user_id],
            )
            .context("failed to record participant heartbeat")?;
        if changed == 0 {
            return Err(Self::missing(conn, session_id, user_id)?);
        }
        SessionStore::touch_activity(conn, session_id, now)
    }

    /// Replace the cursor. `None` clears it. Counts as a sign of life.
    pub fn update_cursor(
        conn: &Connection,
        session_id: &str,
        user_id: &str,
        position: Option<&CursorPosition>,
        now: DateTime<Utc>,
    ) -> CollabResult<()> {
        let (field_path, offset) = match position {
            Some(position) => (Some(position.field_path.as_str()), Some(position.offset)),
            None => (None, None),
        };
        let changed = conn
            .execute(
                "UPDATE collab_participants \
                 SET cursor_field_path = ?1, cursor_offset = ?2, \
                     last_seen_at = MAX(last_seen_at, ?3) \
                 WHERE session_id = ?4 AND user_id = ?5",
                params![field_path, offset, encode_ts(now), session_id, user_id],
            )
            .context("failed to update participant cursor")?;
        if changed == 0 {
            return Err(Self::missing(conn, session_id, user_id)?);
        }
        Ok(())
    }

    /// Participants seen at or after `liveness_cutoff`, in join order.
    pub fn list_active(
        conn: &Connection,
        session_id: &str,
        liveness_cutoff: DateTime<Utc>,
    ) -> CollabResult<Vec<Participant>> {
        if !SessionStore::exists(conn, session_id)? {
            return Err(CollabError::session_not_found(session_id));
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {PARTICIPANT_COLUMNS} FROM collab_participants \
                 WHERE session_id = ?1 AND last_seen_at >= ?2 \
                 ORDER BY joined_at ASC, user_id ASC"
            ))
            .context("failed to prepare active participants query")?;

        let rows = stmt
            .query_map(params![session_id, encode_ts(liveness_cutoff)], row_to_participant)
            .context("failed to query active participants")?;

        let participants = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to collect active participants")?;
        Ok(participants)
    }

    /// Number of presence rows, live or not yet swept.
    pub fn count(conn: &Connection, session_id: &str) -> CollabResult<usize> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM collab_participants WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("failed to count participants")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Explicit removal. Leaving twice is fine; leaving a reclaimed session
    /// is `SessionNotFound`.
    pub fn leave(conn: &Connection, session_id: &str, user_id: &str) -> CollabResult<bool> {
        let removed = conn
            .execute(
                "DELETE FROM collab_participants WHERE session_id = ?1 AND user_id = ?2",
                params![session_id, user_id],
            )
            .context("failed to remove participant")?;
        if removed == 0 && !SessionStore::exists(conn, session_id)? {
            return Err(CollabError::session_not_found(session_id));
        }
        Ok(removed > 0)
    }

    /// Delete every participant last seen before `liveness_cutoff`.
    pub fn prune_stale(conn: &Connection, liveness_cutoff: DateTime<Utc>) -> CollabResult<usize> {
        let removed = conn
            .execute(
                "DELETE FROM collab_participants WHERE last_seen_at < ?1",
                params![encode_ts(liveness_cutoff)],
            )
            .context("failed to prune stale participants")?;
        Ok(removed)
    }

    fn missing(conn: &Connection, session_id: &str, user_id: &str) -> CollabResult<CollabError> {
        if SessionStore::exists(conn, session_id)? {
            Ok(CollabError::participant_not_found(session_id, user_id))
        } else {
            Ok(CollabError::session_not_found(session_id))
        }
    }
}

fn normalize_display_name(display_name: &str, user_id: &str) -> String {
    let trimmed = display_name.trim();
    if trimmed.is_empty() {
        return user_id.to_owned();
    }
    trimmed.chars().take(MAX_DISPLAY_NAME_CHARS).collect()
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let field_path: Option<String> = row.get(4)?;
    let offset: Option<u32> = row.get(5)?;
    let joined_raw: String = row.get(6)?;
    let seen_raw: String = row.get(7)?;

    let cursor = match (field_path, offset) {
        (Some(field_path), Some(offset)) => Some(CursorPosition { field_path, offset }),
        _ => None,
    };

    Ok(Participant {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        display_name: row.get(2)?,
        color: row.get(3)?,
        cursor,
        joined_at: decode_ts(&joined_raw, 6)?,
        last_seen_at: decode_ts(&seen_raw, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CollabDb;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()
    }

    fn setup() -> (CollabDb, String) {
        let db = CollabDb::open_in_memory().unwrap();
        let (session, _) =
            SessionStore::get_or_create(db.connection(), "page-42", t0(), || Ok(json!({})))
                .unwrap();
        (db, session.id)
    }

    fn count_rows(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM collab_participants", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn color_is_stable_per_user() {
        assert_eq!(participant_color("u1"), participant_color("u1"));
        assert!(PARTICIPANT_COLORS.contains(&participant_color("u2")));
    }

    #[test]
    fn join_is_idempotent_and_refreshes_name() {
        let (db, session_id) = setup();
        let first = ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0())
            .expect("first join");
        let later = t0() + Duration::seconds(10);
        let second =
            ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice B.", later)
                .expect("rejoin");

        assert_eq!(count_rows(db.connection()), 1);
        assert_eq!(second.joined_at, first.joined_at);
        assert_eq!(second.last_seen_at, later);
        assert_eq!(second.display_name, "Alice B.");
        assert_eq!(second.color, first.color);
    }

    #[test]
    fn blank_display_name_falls_back_to_user_id() {
        let (db, session_id) = setup();
        let participant =
            ParticipantRegistry::join(db.connection(), &session_id, "u1", "   ", t0()).unwrap();
        assert_eq!(participant.display_name, "u1");
    }

    #[test]
    fn join_on_missing_session_creates_nothing() {
        let (db, _) = setup();
        let error = ParticipantRegistry::join(db.connection(), "gone", "u1", "Alice", t0())
            .expect_err("missing session");
        assert!(matches!(error, CollabError::SessionNotFound { .. }));
        assert_eq!(count_rows(db.connection()), 0);
    }

    #[test]
    fn heartbeat_distinguishes_missing_session_from_missing_participant() {
        let (db, session_id) = setup();

        let error = ParticipantRegistry::heartbeat(db.connection(), &session_id, "u1", t0())
            .expect_err("not joined");
        assert!(matches!(error, CollabError::ParticipantNotFound { .. }));

        let error = ParticipantRegistry::heartbeat(db.connection(), "gone", "u1", t0())
            .expect_err("no session");
        assert!(matches!(error, CollabError::SessionNotFound { .. }));
    }

    #[test]
    fn heartbeat_touches_session_activity() {
        let (db, session_id) = setup();
        ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0()).unwrap();
        let later = t0() + Duration::seconds(45);

        ParticipantRegistry::heartbeat(db.connection(), &session_id, "u1", later).unwrap();

        let session = SessionStore::get_document_state(db.connection(), &session_id).unwrap();
        assert_eq!(session.last_activity_at, later);
        let participant =
            ParticipantRegistry::get(db.connection(), &session_id, "u1").unwrap().unwrap();
        assert_eq!(participant.last_seen_at, later);
    }

    #[test]
    fn cursor_updates_and_clears() {
        let (db, session_id) = setup();
        ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0()).unwrap();
        let position = CursorPosition { field_path: "/title".into(), offset: 3 };

        ParticipantRegistry::update_cursor(db.connection(), &session_id, "u1", Some(&position), t0())
            .unwrap();
        let participant =
            ParticipantRegistry::get(db.connection(), &session_id, "u1").unwrap().unwrap();
        assert_eq!(participant.cursor, Some(position));

        ParticipantRegistry::update_cursor(db.connection(), &session_id, "u1", None, t0()).unwrap();
        let participant =
            ParticipantRegistry::get(db.connection(), &session_id, "u1").unwrap().unwrap();
        assert!(participant.cursor.is_none());
    }

    #[test]
    fn list_active_filters_stale_rows_before_sweep() {
        let (db, session_id) = setup();
        ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0()).unwrap();
        ParticipantRegistry::join(db.connection(), &session_id, "u2", "Bob", t0()).unwrap();
        let later = t0() + Duration::seconds(90);
        ParticipantRegistry::heartbeat(db.connection(), &session_id, "u1", later).unwrap();

        let cutoff = later - Duration::seconds(60);
        let active = ParticipantRegistry::list_active(db.connection(), &session_id, cutoff).unwrap();
        let names: Vec<&str> = active.iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["Alice"]);
        assert_eq!(count_rows(db.connection()), 2);

        assert_eq!(ParticipantRegistry::prune_stale(db.connection(), cutoff).unwrap(), 1);
        assert_eq!(count_rows(db.connection()), 1);
    }

    #[test]
    fn list_active_orders_by_join_time() {
        let (db, session_id) = setup();
        ParticipantRegistry::join(db.connection(), &session_id, "u2", "Bob", t0() + Duration::seconds(1))
            .unwrap();
        ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0()).unwrap();

        let active = ParticipantRegistry::list_active(db.connection(), &session_id, t0()).unwrap();
        let ids: Vec<&str> = active.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[test]
    fn leave_is_idempotent_until_session_is_gone() {
        let (db, session_id) = setup();
        ParticipantRegistry::join(db.connection(), &session_id, "u1", "Alice", t0()).unwrap();

        assert!(ParticipantRegistry::leave(db.connection(), &session_id, "u1").unwrap());
        assert!(!ParticipantRegistry::leave(db.connection(), &session_id, "u1").unwrap());
        assert_eq!(ParticipantRegistry::count(db.connection(), &session_id).unwrap(), 0);

        let error = ParticipantRegistry::leave(db.connection(), "gone", "u1").unwrap_err();
        assert!(matches!(error, CollabError::SessionNotFound { .. }));
    }
}
