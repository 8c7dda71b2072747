// HTTP polling transport over the session coordinator.
//
// Handlers are thin: parse, hop onto the blocking pool (the coordinator does
// synchronous SQLite I/O), map `CollabError` to the error envelope.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use studio_collab_common::protocol::http::{
    OpenSessionRequest, ReportCursorRequest, SubmitEditRequest, SyncQuery, VersionResponse,
    USER_ID_HEADER,
};
use studio_collab_common::types::{AppliedEdit, OpenedSession, Session, SweepReport, SyncState};
use studio_collab_engine::{CollabResult, SessionCoordinator};
use tracing::error;

use crate::error::{ApiError, ErrorCode};

const MAX_USER_ID_BYTES: usize = 256;

#[derive(Clone)]
struct ApiState {
    coordinator: Arc<SessionCoordinator>,
}

/// Identity asserted by the upstream auth gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
}

pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    let state = ApiState { coordinator };

    let sessions = Router::new()
        .route("/v1/sessions", post(open_session))
        .route("/v1/sessions/{session_id}/edits", post(submit_edit))
        .route("/v1/sessions/{session_id}/sync", get(sync))
        .route("/v1/sessions/{session_id}/cursor", put(report_cursor))
        .route("/v1/sessions/{session_id}/participants/me", delete(close_session))
        .route("/v1/sessions/{session_id}/flush", post(flush_session))
        .with_state(state.clone())
        .route_layer(middleware::from_fn(require_user_id));

    let reads = Router::new()
        .route("/v1/sessions/{session_id}", get(document_state))
        .route("/v1/sessions/{session_id}/version", get(current_version))
        .route("/v1/admin/sweep", post(sweep))
        .with_state(state);

    sessions.merge(reads)
}

pub async fn require_user_id(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_USER_ID_BYTES)
        .map(ToOwned::to_owned);

    let Some(user_id) = user_id else {
        return ApiError::new(ErrorCode::ValidationFailed, "missing or invalid x-user-id header")
            .into_response();
    };

    request.extensions_mut().insert(Caller { user_id });
    next.run(request).await
}

// ── Handlers ───────────────────────────────────────────────────────

async fn open_session(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Json(payload): Json<OpenSessionRequest>,
) -> Result<Json<OpenedSession>, ApiError> {
    let opened = run_blocking(&state, move |coordinator| {
        coordinator.open_session(&payload.document_id, &caller.user_id, &payload.display_name)
    })
    .await?;
    Ok(Json(opened))
}

async fn document_state(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session =
        run_blocking(&state, move |coordinator| coordinator.document_state(&session_id)).await?;
    Ok(Json(session))
}

async fn current_version(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<VersionResponse>, ApiError> {
    let version =
        run_blocking(&state, move |coordinator| coordinator.current_version(&session_id)).await?;
    Ok(Json(VersionResponse { version }))
}

async fn submit_edit(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
    Json(payload): Json<SubmitEditRequest>,
) -> Result<Json<AppliedEdit>, ApiError> {
    let applied = run_blocking(&state, move |coordinator| {
        coordinator.submit_edit(
            &session_id,
            &caller.user_id,
            payload.base_version,
            &payload.operation,
        )
    })
    .await?;
    Ok(Json(applied))
}

async fn sync(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncState>, ApiError> {
    let synced = run_blocking(&state, move |coordinator| {
        coordinator.sync(&session_id, &caller.user_id, query.known_version)
    })
    .await?;
    Ok(Json(synced))
}

async fn report_cursor(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
    Json(payload): Json<ReportCursorRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(&state, move |coordinator| {
        coordinator.report_cursor(&session_id, &caller.user_id, payload.position.as_ref())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_session(
    State(state): State<ApiState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    run_blocking(&state, move |coordinator| {
        coordinator.close_session(&session_id, &caller.user_id)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn flush_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session =
        run_blocking(&state, move |coordinator| coordinator.flush_session(&session_id)).await?;
    Ok(Json(session))
}

async fn sweep(State(state): State<ApiState>) -> Result<Json<SweepReport>, ApiError> {
    let report = run_blocking(&state, |coordinator| coordinator.sweep()).await?;
    Ok(Json(report))
}

async fn run_blocking<T, F>(state: &ApiState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SessionCoordinator) -> CollabResult<T> + Send + 'static,
{
    let coordinator = Arc::clone(&state.coordinator);
    match tokio::task::spawn_blocking(move || f(&coordinator)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(join_error) => {
            error!(?join_error, "coordinator call panicked");
            Err(ApiError::from_code(ErrorCode::InternalError))
        }
    }
}
