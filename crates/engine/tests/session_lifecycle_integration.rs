use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use studio_collab_common::operation::EditOperation;
use studio_collab_common::types::{CatchUp, SessionPhase};
use studio_collab_engine::store::CollabDb;
use studio_collab_engine::{
    CollabError, ManualClock, MemoryContentStore, RetentionPolicy, SessionCoordinator,
};

struct Fixture {
    coordinator: SessionCoordinator,
    clock: ManualClock,
    content: Arc<MemoryContentStore>,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap());
    let content =
        Arc::new(MemoryContentStore::new().with_document("page-42", json!({ "title": "Draft" })));
    let coordinator = SessionCoordinator::new(
        CollabDb::open_in_memory().expect("in-memory db should open"),
        content.clone(),
        Arc::new(clock.clone()),
        RetentionPolicy::default(),
    )
    .expect("coordinator should build");
    Fixture { coordinator, clock, content }
}

fn set_title(title: &str) -> EditOperation {
    EditOperation::SetField { path: "/title".into(), value: json!(title) }
}

#[test]
fn two_editors_conflict_rebase_and_converge() {
    let f = fixture();

    let alice = f.coordinator.open_session("page-42", "u1", "Alice").unwrap();
    assert_eq!(alice.session.version, 0);
    let bob = f.coordinator.open_session("page-42", "u2", "Bob").unwrap();
    assert_eq!(bob.session.id, alice.session.id);
    let session_id = bob.session.id;

    f.coordinator.submit_edit(&session_id, "u1", 0, &set_title("Hello")).unwrap();
    let conflict = f.coordinator.submit_edit(&session_id, "u2", 0, &set_title("Hi")).unwrap_err();
    let current = conflict.conflicting_session().expect("bob must see a conflict");
    assert_eq!(current.version, 1);
    assert_eq!(current.document_state["title"], "Hello");

    let state = f.coordinator.sync(&session_id, "u2", 0).unwrap();
    let CatchUp::Edits { edits } = state.catch_up else {
        panic!("expected incremental catch-up");
    };
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].result_version, 1);
    assert_eq!(edits[0].operation, set_title("Hello"));

    let rebased = f.coordinator.submit_edit(&session_id, "u2", 1, &set_title("Hi there")).unwrap();
    assert_eq!(rebased.session.version, 2);
    assert_eq!(rebased.session.document_state["title"], "Hi there");
}

#[test]
fn rejoining_does_not_duplicate_presence() {
    let f = fixture();
    f.coordinator.open_session("page-42", "u1", "Alice").unwrap();
    f.clock.advance(Duration::seconds(5));
    let again = f.coordinator.open_session("page-42", "u1", "Alice").unwrap();

    assert_eq!(again.participants.len(), 1);
    assert_eq!(again.participants[0].user_id, "u1");
}

#[test]
fn silent_participant_drops_out_of_presence_then_gets_swept() {
    let f = fixture();
    let session_id = f.coordinator.open_session("page-42", "u1", "Alice").unwrap().session.id;
    f.coordinator.open_session("page-42", "u2", "Bob").unwrap();

    f.clock.advance(Duration::seconds(61));
    let state = f.coordinator.sync(&session_id, "u1", 0).unwrap();
    let active: Vec<&str> = state.participants.iter().map(|p| p.user_id.as_str()).collect();
    assert_eq!(active, vec!["u1"]);

    let report = f.coordinator.sweep().unwrap();
    assert_eq!(report.participants_removed, 1);
    assert_eq!(report.sessions_closed, 0);

    let error = f.coordinator.sync(&session_id, "u2", 0).unwrap_err();
    assert!(matches!(error, CollabError::ParticipantNotFound { .. }));
}

#[test]
fn reclaimed_session_is_replaced_by_fresh_one_from_content_store() {
    let f = fixture();
    let original = f.coordinator.open_session("page-42", "u1", "Alice").unwrap().session.id;
    f.coordinator.open_session("page-42", "u2", "Bob").unwrap();
    f.coordinator.submit_edit(&original, "u1", 0, &set_title("Published")).unwrap();
    f.coordinator.close_session(&original, "u1").unwrap();
    f.coordinator.close_session(&original, "u2").unwrap();
    assert_eq!(f.coordinator.session_phase(&original).unwrap(), SessionPhase::Empty);

    f.clock.advance(Duration::minutes(29));
    assert_eq!(f.coordinator.sweep().unwrap().sessions_closed, 0);

    f.clock.advance(Duration::minutes(2));
    let report = f.coordinator.sweep().unwrap();
    assert_eq!(report.sessions_closed, 1);
    assert_eq!(f.coordinator.session_phase(&original).unwrap(), SessionPhase::Reclaimed);
    assert!(matches!(
        f.coordinator.document_state(&original),
        Err(CollabError::SessionNotFound { .. })
    ));

    let reopened = f.coordinator.open_session("page-42", "u1", "Alice").unwrap();
    assert_ne!(reopened.session.id, original);
    assert_eq!(reopened.session.version, 0);
    assert_eq!(reopened.session.document_state["title"], "Published");
    assert_eq!(f.content.get("page-42").unwrap()["title"], "Published");
}

#[test]
fn activity_after_cutoff_keeps_empty_session() {
    let f = fixture();
    let session_id = f.coordinator.open_session("page-42", "u1", "Alice").unwrap().session.id;
    f.coordinator.close_session(&session_id, "u1").unwrap();

    f.clock.advance(Duration::minutes(25));
    f.coordinator.open_session("page-42", "u2", "Bob").unwrap();
    f.coordinator.close_session(&session_id, "u2").unwrap();

    f.clock.advance(Duration::minutes(10));
    assert_eq!(f.coordinator.sweep().unwrap().sessions_closed, 0);
    assert_eq!(f.coordinator.session_phase(&session_id).unwrap(), SessionPhase::Empty);
}

#[test]
fn operations_on_reclaimed_session_report_not_found() {
    let f = fixture();
    let session_id = f.coordinator.open_session("page-42", "u1", "Alice").unwrap().session.id;
    f.coordinator.close_session(&session_id, "u1").unwrap();
    f.clock.advance(Duration::hours(1));
    f.coordinator.sweep().unwrap();

    assert!(matches!(
        f.coordinator.submit_edit(&session_id, "u1", 0, &set_title("late")),
        Err(CollabError::SessionNotFound { .. })
    ));
    assert!(matches!(
        f.coordinator.close_session(&session_id, "u1"),
        Err(CollabError::SessionNotFound { .. })
    ));
    assert!(matches!(
        f.coordinator.current_version(&session_id),
        Err(CollabError::SessionNotFound { .. })
    ));
}

#[test]
fn failed_document_load_is_a_hard_error() {
    let f = fixture();
    f.content.set_unavailable(true);
    let error = f.coordinator.open_session("page-42", "u1", "Alice").unwrap_err();
    assert!(matches!(error, CollabError::DocumentLoad { .. }));
    assert!(!error.is_expected());
}
