// Error taxonomy for the session engine.
//
// `VersionConflict`, `SessionNotFound` and `ParticipantNotFound` are normal
// outcomes of concurrent editing and janitor races; callers are expected to
// match on them. Everything else is a failure.

use studio_collab_common::operation::OperationError;
use studio_collab_common::types::Session;
use thiserror::Error;

use crate::content::ContentStoreError;

pub type CollabResult<T> = Result<T, CollabError>;

#[derive(Debug, Error)]
pub enum CollabError {
    /// The submitted base version is stale. Carries the authoritative session
    /// so the caller can rebase.
    #[error("version conflict: session `{}` is at version {}", .session.id, .session.version)]
    VersionConflict { session: Box<Session> },

    #[error("session `{session_id}` not found")]
    SessionNotFound { session_id: String },

    #[error("user `{user_id}` is not attached to session `{session_id}`")]
    ParticipantNotFound { session_id: String, user_id: String },

    #[error("failed to load content for document `{document_id}`")]
    DocumentLoad {
        document_id: String,
        #[source]
        source: ContentStoreError,
    },

    #[error("failed to save content for document `{document_id}`")]
    DocumentSave {
        document_id: String,
        #[source]
        source: ContentStoreError,
    },

    #[error("edit operation cannot be applied: {0}")]
    InvalidOperation(#[from] OperationError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The append-only log no longer matches the version counter. Fatal for
    /// the request; the surrounding transaction is rolled back.
    #[error("edit log invariant violated for session `{session_id}`: {detail}")]
    InvariantViolation { session_id: String, detail: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CollabError {
    pub(crate) fn session_not_found(session_id: &str) -> Self {
        Self::SessionNotFound { session_id: session_id.to_owned() }
    }

    pub(crate) fn participant_not_found(session_id: &str, user_id: &str) -> Self {
        Self::ParticipantNotFound { session_id: session_id.to_owned(), user_id: user_id.to_owned() }
    }

    pub(crate) fn invariant(session_id: &str, detail: impl Into<String>) -> Self {
        Self::InvariantViolation { session_id: session_id.to_owned(), detail: detail.into() }
    }

    /// True for outcomes that are part of normal operation and must not be
    /// reported as errors.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::SessionNotFound { .. }
                | Self::ParticipantNotFound { .. }
        )
    }

    /// The authoritative session carried by a `VersionConflict`.
    pub fn conflicting_session(&self) -> Option<&Session> {
        match self {
            Self::VersionConflict { session } => Some(session.as_ref()),
            _ => None,
        }
    }
}
