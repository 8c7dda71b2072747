use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// How long a writer waits for another connection's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE collab_sessions (
    session_id          TEXT PRIMARY KEY,
    document_id         TEXT NOT NULL UNIQUE,
    version             INTEGER NOT NULL DEFAULT 0 CHECK (version >= 0),
    document_state      TEXT NOT NULL,
    flushed_version     INTEGER NOT NULL DEFAULT 0 CHECK (flushed_version >= 0),
    created_at          TEXT NOT NULL,
    last_activity_at    TEXT NOT NULL
);

CREATE INDEX collab_sessions_activity_idx
    ON collab_sessions (last_activity_at);

CREATE TABLE collab_participants (
    session_id          TEXT NOT NULL
                        REFERENCES collab_sessions (session_id) ON DELETE CASCADE,
    user_id             TEXT NOT NULL,
    display_name        TEXT NOT NULL,
    color               TEXT NOT NULL,
    cursor_field_path   TEXT NULL,
    cursor_offset       INTEGER NULL,
    joined_at           TEXT NOT NULL,
    last_seen_at        TEXT NOT NULL,
    PRIMARY KEY (session_id, user_id)
);

CREATE INDEX collab_participants_seen_idx
    ON collab_participants (last_seen_at);

CREATE TABLE collab_edits (
    session_id          TEXT NOT NULL
                        REFERENCES collab_sessions (session_id) ON DELETE CASCADE,
    base_version        INTEGER NOT NULL CHECK (base_version >= 0),
    result_version      INTEGER NOT NULL CHECK (result_version = base_version + 1),
    user_id             TEXT NOT NULL,
    operation           TEXT NOT NULL,
    applied_at          TEXT NOT NULL,
    PRIMARY KEY (session_id, result_version)
);

CREATE INDEX collab_edits_applied_idx
    ON collab_edits (applied_at);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Handle to the shared session database.
///
/// Several handles (in one process or many) may point at the same file;
/// coordination happens through SQLite's own locking.
#[derive(Debug)]
pub struct CollabDb {
    conn: Connection,
}

impl CollabDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create collab db parent directory `{}`", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open collab db at `{}`", path.display()))?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory collab db")?;
        Self::configure(conn)
    }

    fn configure(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).context("failed to set sqlite busy timeout")?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )
        .context("failed to configure sqlite pragmas for collab db")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.conn)
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let mut current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        // Another process may have migrated between our read and this transaction.
        let applied: i64 = tx
            .query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to check migration v{version}"))?;
        if applied > 0 {
            current_version = *version;
            continue;
        }

        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply collab db migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        current_version = *version;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::CollabDb;

    const EXPECTED_TABLES: &[&str] =
        &["schema_migrations", "collab_sessions", "collab_participants", "collab_edits"];

    #[test]
    fn open_creates_schema_and_records_latest_migration() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db = CollabDb::open(dir.path().join("collab.db")).expect("collab db should open");

        for table in EXPECTED_TABLES {
            let exists: i64 = db
                .connection()
                .query_row(
                    "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("table existence query should succeed");

            assert_eq!(exists, 1, "expected `{table}` table to exist");
        }

        assert_eq!(db.schema_version().expect("schema version should be readable"), 1);
    }

    #[test]
    fn opening_twice_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("collab.db");
        {
            let first = CollabDb::open(&path).expect("first open should succeed");
            assert_eq!(first.schema_version().expect("schema version should be readable"), 1);
        }

        let second = CollabDb::open(&path).expect("second open should succeed");
        let migration_rows: i64 = second
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("schema migration count query should succeed");
        assert_eq!(migration_rows, 1);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let db = CollabDb::open_in_memory().expect("in-memory db should open");
        let result = db.connection().execute(
            "INSERT INTO collab_participants \
             (session_id, user_id, display_name, color, joined_at, last_seen_at) \
             VALUES ('missing', 'u1', 'Alice', '#e06c75', 'x', 'x')",
            [],
        );
        assert!(result.is_err(), "orphaned participant rows must be rejected");
    }

    #[test]
    fn result_version_must_follow_base_version() {
        let db = CollabDb::open_in_memory().expect("in-memory db should open");
        db.connection()
            .execute(
                "INSERT INTO collab_sessions \
                 (session_id, document_id, document_state, created_at, last_activity_at) \
                 VALUES ('s-1', 'page-1', '{}', 'x', 'x')",
                [],
            )
            .expect("session insert should succeed");
        let result = db.connection().execute(
            "INSERT INTO collab_edits \
             (session_id, base_version, result_version, user_id, operation, applied_at) \
             VALUES ('s-1', 0, 2, 'u1', '{}', 'x')",
            [],
        );
        assert!(result.is_err(), "skipping a version must be rejected by the schema");
    }
}
