// Core domain types shared by the session engine and its transports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::EditOperation;

/// The live working copy of one CMS document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub document_id: String,
    /// Optimistic-concurrency token. Starts at 0, +1 per accepted edit.
    pub version: u64,
    pub document_state: serde_json::Value,
    /// Highest version saved back to the content store.
    pub flushed_version: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// True when accepted edits have not yet been flushed to the content store.
    pub fn is_dirty(&self) -> bool {
        self.version > self.flushed_version
    }
}

/// Where a participant's caret sits inside the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorPosition {
    /// JSON Pointer of the field being edited, e.g. `/sections/0/title`.
    pub field_path: String,
    /// Character offset inside that field.
    pub offset: u32,
}

/// A user attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    /// Hex color (e.g. `#e06c75`), stable per user.
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One accepted, version-stamped operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edit {
    pub session_id: String,
    pub base_version: u64,
    pub result_version: u64,
    pub user_id: String,
    pub operation: EditOperation,
    pub applied_at: DateTime<Utc>,
}

/// Observable lifecycle of a session.
///
/// `Empty -> Active` on first join, back to `Empty` when the last participant
/// leaves or times out, `Reclaimed` once the janitor deletes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Empty,
    Active,
    Reclaimed,
}

/// Result of `open_session`: enough to render content and presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenedSession {
    pub session: Session,
    pub participants: Vec<Participant>,
}

/// Result of an accepted `submit_edit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedEdit {
    pub session: Session,
    pub edit: Edit,
}

/// How a lagging client catches up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatchUp {
    /// Every edit newer than the client's known version, ascending.
    Edits { edits: Vec<Edit> },
    /// The log cannot cover the gap; reload the whole snapshot.
    Resync { session: Session },
}

/// Result of a steady-state `sync` poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub current_version: u64,
    pub catch_up: CatchUp,
    pub participants: Vec<Participant>,
}

/// Counts from one janitorial pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_closed: usize,
    pub edits_pruned: usize,
    pub participants_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.sessions_closed == 0 && self.edits_pruned == 0 && self.participants_removed == 0
    }
}
