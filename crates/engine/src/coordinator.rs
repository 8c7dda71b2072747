// Session Coordinator: the only entry point transports talk to.
//
// Each operation is one IMMEDIATE transaction against the shared database.
// The mutex only serializes this handle's connection; a second coordinator
// (another thread or process) on the same file is coordinated by SQLite.
// Content store loads happen outside the transaction, except for the rare
// reseed after a concurrent reclaim. Saves (flushes) happen inside it.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde_json::Value;
use studio_collab_common::operation::EditOperation;
use studio_collab_common::types::{
    AppliedEdit, CatchUp, CursorPosition, Edit, OpenedSession, Session, SessionPhase, SweepReport,
    SyncState,
};
use tracing::{debug, error, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::content::{validate_document_id, ContentStore};
use crate::error::{CollabError, CollabResult};
use crate::policy::RetentionPolicy;
use crate::store::{CollabDb, EditLog, ParticipantRegistry, SessionStore};

const MAX_USER_ID_LEN: usize = 256;

pub struct SessionCoordinator {
    db: Mutex<CollabDb>,
    content: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    policy: RetentionPolicy,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("clock", &self.clock)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SessionCoordinator {
    pub fn new(
        db: CollabDb,
        content: Arc<dyn ContentStore>,
        clock: Arc<dyn Clock>,
        policy: RetentionPolicy,
    ) -> CollabResult<Self> {
        policy.validate()?;
        Ok(Self { db: Mutex::new(db), content, clock, policy })
    }

    /// Open (or create) the database at `path` with the system clock.
    pub fn open(
        path: impl AsRef<Path>,
        content: Arc<dyn ContentStore>,
        policy: RetentionPolicy,
    ) -> CollabResult<Self> {
        let db = CollabDb::open(path)?;
        Self::new(db, content, Arc::new(SystemClock), policy)
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Attach `user_id` to the session for `document_id`, creating the
    /// session from the content store if none exists.
    pub fn open_session(
        &self,
        document_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> CollabResult<OpenedSession> {
        let _span = info_span!("collab.coordinator.open_session", document_id, user_id).entered();
        validate_document_id(document_id)
            .map_err(|_| CollabError::InvalidInput(format!("invalid document id `{document_id}`")))?;
        validate_user_id(user_id)?;

        let existing = self.with_conn(|conn| SessionStore::find_by_document(conn, document_id))?;
        let mut seed = match existing {
            Some(_) => None,
            None => Some(self.load_content(document_id)?),
        };

        let now = self.clock.now();
        let liveness_cutoff = self.policy.cutoffs(now).liveness;
        let (opened, created) = self.in_transaction(|tx| {
            let (session, created) = SessionStore::get_or_create(tx, document_id, now, || {
                match seed.take() {
                    Some(seed) => Ok(seed),
                    // Reclaimed between the check above and this transaction.
                    None => self.load_content(document_id),
                }
            })?;
            ParticipantRegistry::join(tx, &session.id, user_id, display_name, now)?;
            let participants = ParticipantRegistry::list_active(tx, &session.id, liveness_cutoff)?;
            let session = SessionStore::get_document_state(tx, &session.id)?;
            Ok((OpenedSession { session, participants }, created))
        })?;

        if created {
            info!(
                session_id = %opened.session.id,
                document_id,
                "created collab session"
            );
        }
        debug!(
            session_id = %opened.session.id,
            version = opened.session.version,
            participants = opened.participants.len(),
            "participant joined session"
        );
        Ok(opened)
    }

    /// Apply `operation` if `base_version` is still the session's version.
    /// The author must be attached to the session.
    pub fn submit_edit(
        &self,
        session_id: &str,
        user_id: &str,
        base_version: u64,
        operation: &EditOperation,
    ) -> CollabResult<AppliedEdit> {
        let _span = info_span!(
            "collab.coordinator.submit_edit",
            session_id,
            user_id,
            base_version,
            op = operation.kind(),
            path = operation.target_path()
        )
        .entered();

        let now = self.clock.now();
        let result = self.in_transaction(|tx| {
            ParticipantRegistry::heartbeat(tx, session_id, user_id, now)?;
            let session = SessionStore::apply_edit(tx, session_id, base_version, operation, now)?;
            let edit = EditLog::record(
                tx,
                session_id,
                base_version,
                session.version,
                operation,
                user_id,
                now,
            )?;
            Ok(AppliedEdit { session, edit })
        });

        match &result {
            Ok(applied) => debug!(version = applied.session.version, "edit applied"),
            Err(error) => self.log_failure("submit_edit", error),
        }
        result
    }

    /// Steady-state poll: heartbeat, catch-up from `known_version`, presence.
    pub fn sync(
        &self,
        session_id: &str,
        user_id: &str,
        known_version: u64,
    ) -> CollabResult<SyncState> {
        let _span =
            info_span!("collab.coordinator.sync", session_id, user_id, known_version).entered();

        let now = self.clock.now();
        let liveness_cutoff = self.policy.cutoffs(now).liveness;
        let result = self.in_transaction(|tx| {
            ParticipantRegistry::heartbeat(tx, session_id, user_id, now)?;
            let session = SessionStore::get_document_state(tx, session_id)?;
            let edits = if known_version < session.version {
                EditLog::get_since(tx, session_id, known_version)?
            } else {
                Vec::new()
            };
            let participants = ParticipantRegistry::list_active(tx, session_id, liveness_cutoff)?;
            Ok(SyncState {
                current_version: session.version,
                catch_up: catch_up_from(session, known_version, edits),
                participants,
            })
        });

        match &result {
            Ok(SyncState { catch_up: CatchUp::Resync { .. }, current_version, .. }) => {
                debug!(current_version, "edit log cannot cover gap; sending resync");
            }
            Ok(_) => {}
            Err(error) => self.log_failure("sync", error),
        }
        result
    }

    /// Replace (or clear, with `None`) the caller's cursor.
    pub fn report_cursor(
        &self,
        session_id: &str,
        user_id: &str,
        position: Option<&CursorPosition>,
    ) -> CollabResult<()> {
        let _span = info_span!("collab.coordinator.report_cursor", session_id, user_id).entered();
        let now = self.clock.now();
        self.in_transaction(|tx| {
            ParticipantRegistry::update_cursor(tx, session_id, user_id, position, now)
        })
    }

    /// Detach the caller. Returns false when they were already gone.
    pub fn close_session(&self, session_id: &str, user_id: &str) -> CollabResult<bool> {
        let _span = info_span!("collab.coordinator.close_session", session_id, user_id).entered();
        let removed =
            self.in_transaction(|tx| ParticipantRegistry::leave(tx, session_id, user_id))?;
        debug!(removed, "participant left session");
        Ok(removed)
    }

    pub fn document_state(&self, session_id: &str) -> CollabResult<Session> {
        self.with_conn(|conn| SessionStore::get_document_state(conn, session_id))
    }

    pub fn current_version(&self, session_id: &str) -> CollabResult<u64> {
        Ok(self.document_state(session_id)?.version)
    }

    /// Ids that were never issued are indistinguishable from reclaimed ones.
    pub fn session_phase(&self, session_id: &str) -> CollabResult<SessionPhase> {
        let liveness_cutoff = self.policy.cutoffs(self.clock.now()).liveness;
        self.with_conn(|conn| {
            if !SessionStore::exists(conn, session_id)? {
                return Ok(SessionPhase::Reclaimed);
            }
            let active = ParticipantRegistry::list_active(conn, session_id, liveness_cutoff)?;
            Ok(if active.is_empty() { SessionPhase::Empty } else { SessionPhase::Active })
        })
    }

    /// Save the current state to the content store and mark it flushed.
    pub fn flush_session(&self, session_id: &str) -> CollabResult<Session> {
        let _span = info_span!("collab.coordinator.flush_session", session_id).entered();
        let flushed = self.in_transaction(|tx| {
            let snapshot = SessionStore::get_document_state(tx, session_id)?;
            self.flush_snapshot(tx, &snapshot)?;
            SessionStore::get_document_state(tx, session_id)
        })?;
        info!(version = flushed.version, "flushed session to content store");
        Ok(flushed)
    }

    /// One janitorial pass. Safe to run from several processes at once and
    /// alongside live traffic: every delete re-checks its cutoff.
    pub fn sweep(&self) -> CollabResult<SweepReport> {
        let _span = info_span!("collab.coordinator.sweep").entered();
        let cutoffs = self.policy.cutoffs(self.clock.now());
        let mut report = SweepReport::default();

        report.participants_removed =
            self.in_transaction(|tx| ParticipantRegistry::prune_stale(tx, cutoffs.liveness))?;

        let candidates =
            self.with_conn(|conn| SessionStore::list_reclaimable(conn, cutoffs.inactivity))?;
        for candidate in candidates {
            let outcome = self.in_transaction(|tx| {
                // The candidate list is stale by now; decide on a fresh read.
                let Some(session) = SessionStore::get(tx, &candidate.id)? else {
                    return Ok(None);
                };
                if session.last_activity_at >= cutoffs.inactivity {
                    return Ok(None);
                }
                if session.is_dirty() {
                    self.flush_snapshot(tx, &session)?;
                }
                let edits = EditLog::count_for_session(tx, &session.id)?;
                let deleted =
                    SessionStore::delete_if_reclaimable(tx, &session.id, cutoffs.inactivity)?;
                Ok(deleted.then_some(edits))
            });

            match outcome {
                Ok(Some(edits)) => {
                    report.sessions_closed += 1;
                    report.edits_pruned += edits;
                    debug!(session_id = %candidate.id, edits, "reclaimed idle session");
                }
                Ok(None) => {}
                Err(error @ CollabError::DocumentSave { .. }) => {
                    warn!(
                        session_id = %candidate.id,
                        document_id = %candidate.document_id,
                        version = candidate.version,
                        error = %error,
                        "failed to flush session before reclaim; keeping it"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        report.edits_pruned += self.in_transaction(|tx| EditLog::prune(tx, cutoffs.edit_retention))?;

        if !report.is_empty() {
            info!(
                sessions_closed = report.sessions_closed,
                edits_pruned = report.edits_pruned,
                participants_removed = report.participants_removed,
                "sweep completed"
            );
        }
        Ok(report)
    }

    /// Runs inside the caller's IMMEDIATE transaction. Holding the write lock
    /// across the save keeps saves of one session in version order, across
    /// processes too, so `flushed_version` always matches what the content
    /// store holds.
    fn flush_snapshot(&self, conn: &Connection, snapshot: &Session) -> CollabResult<()> {
        self.content
            .save_document_content(&snapshot.document_id, &snapshot.document_state)
            .map_err(|source| CollabError::DocumentSave {
                document_id: snapshot.document_id.clone(),
                source,
            })?;
        SessionStore::mark_flushed(conn, &snapshot.id, snapshot.version)
    }

    fn load_content(&self, document_id: &str) -> CollabResult<Value> {
        self.content.load_document_content(document_id).map_err(|source| {
            CollabError::DocumentLoad { document_id: document_id.to_owned(), source }
        })
    }

    fn log_failure(&self, operation: &str, error: &CollabError) {
        match error {
            CollabError::VersionConflict { session } => {
                debug!(operation, current_version = session.version, "version conflict");
            }
            error if error.is_expected() => debug!(operation, error = %error, "request rejected"),
            CollabError::InvariantViolation { .. } => {
                error!(operation, error = %error, "edit log invariant violated");
            }
            _ => {}
        }
    }

    fn lock_db(&self) -> CollabResult<MutexGuard<'_, CollabDb>> {
        self.db.lock().map_err(|_| CollabError::Storage(anyhow!("collab db lock poisoned")))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> CollabResult<T>) -> CollabResult<T> {
        let db = self.lock_db()?;
        f(db.connection())
    }

    /// Run `f` in an IMMEDIATE transaction; any error rolls everything back.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> CollabResult<T>,
    ) -> CollabResult<T> {
        let mut db = self.lock_db()?;
        let tx = db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin collab transaction")?;
        let value = f(&tx)?;
        tx.commit().context("failed to commit collab transaction")?;
        Ok(value)
    }
}

fn validate_user_id(user_id: &str) -> CollabResult<()> {
    if user_id.trim().is_empty() || user_id.len() > MAX_USER_ID_LEN {
        return Err(CollabError::InvalidInput("user id must be 1-256 bytes".into()));
    }
    Ok(())
}

/// Edits are only sent when they provably cover `known_version..=current`;
/// otherwise the client reloads the snapshot.
fn catch_up_from(session: Session, known_version: u64, edits: Vec<Edit>) -> CatchUp {
    if known_version > session.version {
        return CatchUp::Resync { session };
    }
    if known_version == session.version {
        return CatchUp::Edits { edits: Vec::new() };
    }

    let complete = edits.first().map(|edit| edit.base_version) == Some(known_version)
        && edits.last().map(|edit| edit.result_version) == Some(session.version)
        && u64::try_from(edits.len()).ok() == Some(session.version - known_version);
    if complete {
        CatchUp::Edits { edits }
    } else {
        CatchUp::Resync { session }
    }
}
