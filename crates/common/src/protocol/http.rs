// Request/response bodies for the HTTP polling transport.
//
// Responses reuse the domain types in `crate::types`; only request bodies and
// small wrappers live here.

use serde::{Deserialize, Serialize};

use crate::operation::EditOperation;
use crate::types::CursorPosition;

/// Header carrying the caller's pre-validated user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// `POST /v1/sessions`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenSessionRequest {
    pub document_id: String,
    pub display_name: String,
}

/// `POST /v1/sessions/{session_id}/edits`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitEditRequest {
    pub base_version: u64,
    pub operation: EditOperation,
}

/// Query string of `GET /v1/sessions/{session_id}/sync`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncQuery {
    #[serde(default)]
    pub known_version: u64,
}

/// `PUT /v1/sessions/{session_id}/cursor`. A null or missing position
/// clears the cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportCursorRequest {
    #[serde(default)]
    pub position: Option<CursorPosition>,
}

/// `GET /v1/sessions/{session_id}/version`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionResponse {
    pub version: u64,
}
