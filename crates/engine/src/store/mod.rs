// Shared-state layer: one SQLite database, three tables.
//
// The store types are stateless; every function takes the connection (or an
// open transaction, which derefs to one) it should run against, so the
// coordinator decides transaction boundaries.

pub mod db;
pub mod edits;
pub mod participants;
pub mod sessions;

pub use db::CollabDb;
pub use edits::EditLog;
pub use participants::{participant_color, ParticipantRegistry};
pub use sessions::SessionStore;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

use crate::error::{CollabError, CollabResult};

/// Fixed-width RFC 3339 so that SQL string comparison is chronological.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: usize,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

pub(crate) fn decode_version(raw: i64, column: usize) -> rusqlite::Result<u64> {
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}

pub(crate) fn sql_version(version: u64) -> CollabResult<i64> {
    i64::try_from(version)
        .map_err(|_| CollabError::InvalidInput(format!("version {version} is out of range")))
}
