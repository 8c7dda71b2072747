use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use studio_collab_common::operation::{replay, EditOperation};
use studio_collab_common::types::CatchUp;
use studio_collab_engine::store::CollabDb;
use studio_collab_engine::{ManualClock, MemoryContentStore, RetentionPolicy, SessionCoordinator};

const FIELDS: &[&str] = &["/title", "/subtitle", "/hero/image", "/hero/alt"];

fn operation_strategy() -> impl Strategy<Value = EditOperation> {
    prop_oneof![
        3 => (0..FIELDS.len(), any::<i32>()).prop_map(|(field, value)| EditOperation::SetField {
            path: FIELDS[field].to_owned(),
            value: json!(value),
        }),
        2 => any::<u16>().prop_map(|value| EditOperation::InsertItem {
            path: "/sections".into(),
            index: 0,
            value: json!({ "id": value }),
        }),
        1 => Just(EditOperation::ReplaceDocument {
            value: json!({ "title": "Reset", "sections": [] }),
        }),
    ]
}

/// Apply `operations` in order and return the snapshot after each version,
/// starting with version 0.
fn run_history(
    coordinator: &SessionCoordinator,
    session_id: &str,
    operations: &[EditOperation],
) -> Vec<Value> {
    let mut snapshots = vec![coordinator.document_state(session_id).unwrap().document_state];
    for (base, operation) in operations.iter().enumerate() {
        let applied = coordinator
            .submit_edit(session_id, "u1", base as u64, operation)
            .expect("sequential submit at current version should apply");
        snapshots.push(applied.session.document_state);
    }
    snapshots
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn replaying_edits_since_any_version_reaches_current_state(
        operations in prop::collection::vec(operation_strategy(), 1..24),
        known_seed in any::<prop::sample::Index>(),
    ) {
        let content = Arc::new(
            MemoryContentStore::new().with_document("page-42", json!({ "title": "Draft", "sections": [] })),
        );
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap());
        let coordinator = SessionCoordinator::new(
            CollabDb::open_in_memory().unwrap(),
            content,
            Arc::new(clock),
            RetentionPolicy::default(),
        )
        .unwrap();
        let session_id = coordinator.open_session("page-42", "u1", "Alice").unwrap().session.id;

        let snapshots = run_history(&coordinator, &session_id, &operations);
        let known = known_seed.index(snapshots.len());

        let state = coordinator.sync(&session_id, "u1", known as u64).unwrap();
        prop_assert_eq!(state.current_version, operations.len() as u64);

        let CatchUp::Edits { edits } = state.catch_up else {
            return Err(TestCaseError::fail("retained history must not force a resync"));
        };
        prop_assert_eq!(edits.len(), operations.len() - known);

        let mut replayed = snapshots[known].clone();
        replay(&mut replayed, edits.iter().map(|edit| &edit.operation))
            .expect("logged operations must replay cleanly");
        prop_assert_eq!(&replayed, snapshots.last().unwrap());
    }
}
