use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use studio_collab_engine::{CollabError, ContentStoreError};
use tracing::{error, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    SessionNotFound,
    ParticipantNotFound,
    DocumentNotFound,
    VersionConflict,
    ContentStoreUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::ParticipantNotFound => "PARTICIPANT_NOT_FOUND",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::ContentStoreUnavailable => "CONTENT_STORE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::ParticipantNotFound => StatusCode::NOT_FOUND,
            Self::DocumentNotFound => StatusCode::NOT_FOUND,
            Self::VersionConflict => StatusCode::CONFLICT,
            Self::ContentStoreUnavailable => StatusCode::BAD_GATEWAY,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::ContentStoreUnavailable | Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::SessionNotFound => "session not found; reopen the document",
            Self::ParticipantNotFound => "caller is not attached to this session; reopen the document",
            Self::DocumentNotFound => "document does not exist in the content store",
            Self::VersionConflict => "base version is stale; rebase onto the current session",
            Self::ContentStoreUnavailable => "content store is unavailable",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<CollabError> for ApiError {
    fn from(error: CollabError) -> Self {
        match error {
            CollabError::VersionConflict { session } => {
                let details = json!({ "session": session });
                Self::from_code(ErrorCode::VersionConflict).with_details(details)
            }
            CollabError::SessionNotFound { session_id } => {
                Self::from_code(ErrorCode::SessionNotFound)
                    .with_details(json!({ "session_id": session_id }))
            }
            CollabError::ParticipantNotFound { session_id, user_id } => {
                Self::from_code(ErrorCode::ParticipantNotFound)
                    .with_details(json!({ "session_id": session_id, "user_id": user_id }))
            }
            CollabError::DocumentLoad { document_id, source: ContentStoreError::NotFound(_) } => {
                Self::from_code(ErrorCode::DocumentNotFound)
                    .with_details(json!({ "document_id": document_id }))
            }
            error @ (CollabError::DocumentLoad { .. } | CollabError::DocumentSave { .. }) => {
                warn!(error = ?error, "content store call failed");
                Self::from_code(ErrorCode::ContentStoreUnavailable)
            }
            error @ (CollabError::InvalidOperation(_) | CollabError::InvalidInput(_)) => {
                Self::new(ErrorCode::ValidationFailed, error.to_string())
            }
            error @ (CollabError::InvariantViolation { .. } | CollabError::Storage(_)) => {
                error!(error = ?error, "collab engine internal error");
                Self::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use chrono::Utc;
    use serde_json::{json, Value};
    use studio_collab_common::operation::OperationError;
    use studio_collab_common::types::Session;
    use studio_collab_engine::{CollabError, ContentStoreError};

    use super::{with_request_id_scope, ApiError, ErrorCode};

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn api_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["x-request-id"], "req-scoped-123");
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], json!({}));
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ApiError::from_code(ErrorCode::ValidationFailed)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
    }

    #[tokio::test]
    async fn version_conflict_carries_authoritative_session() {
        let now = Utc::now();
        let session = Session {
            id: "s-1".into(),
            document_id: "page-42".into(),
            version: 1,
            document_state: json!({ "title": "Hello" }),
            flushed_version: 0,
            created_at: now,
            last_activity_at: now,
        };
        let error = ApiError::from(CollabError::VersionConflict { session: Box::new(session) });
        assert_eq!(error.code(), ErrorCode::VersionConflict);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["retryable"], false);
        assert_eq!(parsed["error"]["details"]["session"]["version"], 1);
        assert_eq!(parsed["error"]["details"]["session"]["document_state"]["title"], "Hello");
    }

    #[test]
    fn engine_errors_map_to_registry_codes() {
        let cases = [
            (
                CollabError::SessionNotFound { session_id: "s-1".into() },
                ErrorCode::SessionNotFound,
            ),
            (
                CollabError::ParticipantNotFound { session_id: "s-1".into(), user_id: "u1".into() },
                ErrorCode::ParticipantNotFound,
            ),
            (
                CollabError::InvalidOperation(OperationError::RootNotRemovable),
                ErrorCode::ValidationFailed,
            ),
            (CollabError::InvalidInput("bad id".into()), ErrorCode::ValidationFailed),
            (
                CollabError::DocumentLoad {
                    document_id: "page-9".into(),
                    source: ContentStoreError::NotFound("page-9".into()),
                },
                ErrorCode::DocumentNotFound,
            ),
            (
                CollabError::DocumentSave {
                    document_id: "page-9".into(),
                    source: ContentStoreError::Unavailable("down".into()),
                },
                ErrorCode::ContentStoreUnavailable,
            ),
            (
                CollabError::InvariantViolation { session_id: "s-1".into(), detail: "gap".into() },
                ErrorCode::InternalError,
            ),
            (CollabError::Storage(anyhow::anyhow!("disk full")), ErrorCode::InternalError),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).code(), expected);
        }
    }

    #[test]
    fn status_and_retry_registry() {
        assert_eq!(ErrorCode::ContentStoreUnavailable.status(), StatusCode::BAD_GATEWAY);
        assert!(ErrorCode::ContentStoreUnavailable.retryable());
        assert!(!ErrorCode::SessionNotFound.retryable());
        assert_eq!(ErrorCode::ParticipantNotFound.as_str(), "PARTICIPANT_NOT_FOUND");
    }
}
