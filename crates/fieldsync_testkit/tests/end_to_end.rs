//! End-to-end reconciliation against the fake server.

use fieldsync_core::{EntityType, OutboxStatus, ResolutionStrategy};
use fieldsync_engine::{Clock, ResolveConflict, ResolveOutcome, RunOutcome, SyncError, SyncState};
use fieldsync_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

#[tokio::test]
async fn supply_remap_reaches_every_reference() {
    let rig = TestRig::new("u1");
    rig.create(EntityType::Supply, json!({"id": "local-1", "name": "Gauze"}));
    rig.create(
        EntityType::Task,
        json!({"id": "t-1", "title": "Restock", "supply_id": "local-1"}),
    );

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert!(report.is_fully_successful());
    assert_eq!(report.push.remapped, 1);

    assert!(rig.store.get_entity_row(EntityType::Supply, "local-1").is_none());
    assert!(rig.store.get_entity_row(EntityType::Supply, "srv-1").is_some());
    let task = rig.store.get_entity_row(EntityType::Task, "t-1").unwrap();
    assert_eq!(task.get_str("supply_id"), Some("srv-1"));

    // The server received the task with the already remapped reference.
    assert_eq!(rig.server.row(EntityType::Task, "t-1").unwrap()["supply_id"], "srv-1");

    let records = rig.store.outbox_entries();
    assert!(records.iter().any(|r| r.entity_id == "srv-1"));
    assert!(records.iter().all(|r| r.entity_id != "local-1"));
    assert!(rig.is_converged());
}

#[tokio::test]
async fn second_run_is_idle() {
    let rig = TestRig::new("u1");
    rig.create(EntityType::Location, json!({"id": "local-1", "name": "North clinic"}));
    rig.engine.run_sync("u1").await.unwrap();
    let pushes = rig.server.push_count();
    let outbox = rig.store.outbox_entries().len();

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.attempted, 0);
    assert_eq!(rig.server.push_count(), pushes);
    assert_eq!(rig.store.outbox_entries().len(), outbox);
}

#[tokio::test]
async fn transient_failures_retry_until_converged() {
    let rig = TestRig::new("u1");
    rig.create(EntityType::Supply, json!({"id": "local-1", "name": "Gauze"}));
    rig.server.fail_next_pushes(2);

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.failed, 1);
    assert!(!report.is_fully_successful());
    let record = &rig.store.pending_outbox_entries("u1")[0];
    assert_eq!(record.retry_count, 1);
    assert!(record.last_attempt_at.is_some());

    rig.engine.run_sync("u1").await.unwrap();
    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.succeeded, 1);
    assert!(rig.is_converged());
}

#[tokio::test]
async fn offline_run_keeps_everything_pending() {
    let rig = TestRig::new("u1");
    rig.create(EntityType::Supply, json!({"id": "local-1", "name": "Gauze"}));
    rig.server.set_online(false);

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.failed, 1);
    assert_eq!(report.pull.as_ref().unwrap().errors.len(), 8);
    assert_eq!(rig.store.outbox_counts().pending, 1);
    assert_eq!(rig.engine.state(), SyncState::Idle);

    rig.server.set_online(true);
    rig.engine.run_sync("u1").await.unwrap();
    assert!(rig.is_converged());
}

#[tokio::test]
async fn conflict_gates_push_and_pull_until_reset() {
    let rig = TestRig::new("u1");
    rig.server
        .seed(EntityType::Registration, json!({"id": "r1", "person_name": "Anna"}));
    rig.server.conflict_on(EntityType::Registration, "r1", "person_name");
    rig.create(EntityType::Registration, json!({"id": "r1", "person_name": "Ana"}));

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.outcome, RunOutcome::ConflictPending { conflicts: 1 });
    assert_eq!(rig.server.pull_count(), 0);

    let pushes = rig.server.push_count();
    for _ in 0..3 {
        let err = rig.engine.run_sync("u1").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictsPending { count: 1 }));
    }
    assert_eq!(rig.server.push_count(), pushes);
    assert_eq!(rig.server.pull_count(), 0);

    let conflicts = rig.engine.list_conflicts("u1");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_field(), Some("person_name"));
    assert_eq!(conflicts[0].server.as_ref().unwrap()["person_name"], "Anna");

    let outcome = rig
        .engine
        .resolve_conflict(
            "u1",
            ResolveConflict::new(EntityType::Registration, "r1", ResolutionStrategy::Merge)
                .with_payload(json!({"person_name": "Ana Maria"})),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ResolveOutcome::Resolved);
    assert!(rig.engine.reset());

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert!(report.is_fully_successful());
    assert!(rig.server.pull_count() > 0);
    let local = rig.store.get_entity_row(EntityType::Registration, "r1").unwrap();
    assert_eq!(local.get_str("person_name"), Some("Ana Maria"));
    assert_eq!(
        rig.server.row(EntityType::Registration, "r1").unwrap()["person_name"],
        "Ana Maria"
    );
    assert!(rig.is_converged());
}

#[tokio::test]
async fn repeated_conflicts_leave_one_item() {
    let rig = TestRig::new("u1");
    rig.server.conflict_on(EntityType::Registration, "r1", "person_name");
    let first = rig.create(EntityType::Registration, json!({"id": "r1", "person_name": "Ana"}));
    rig.engine.run_sync("u1").await.unwrap();

    // A later offline edit of the same registration reuses the entry.
    let second = rig.edit(EntityType::Registration, "r1", json!({"person_name": "Ana M."}));
    assert_eq!(first.sync_id, second.sync_id);
    assert_eq!(rig.engine.list_conflicts("u1").len(), 1);
    assert_eq!(
        rig.store.outbox_entry(&first.sync_id).unwrap().status,
        OutboxStatus::Conflict
    );
}

#[tokio::test]
async fn conflict_resolved_elsewhere_asks_for_refresh() {
    let rig = TestRig::new("u1");
    rig.server
        .seed(EntityType::Alert, json!({"id": "a1", "severity": "medium"}));
    rig.server.conflict_on(EntityType::Alert, "a1", "severity");
    rig.create(EntityType::Alert, json!({"id": "a1", "severity": "high"}));
    rig.engine.run_sync("u1").await.unwrap();
    rig.server.resolve_elsewhere(EntityType::Alert, "a1");

    let outcome = rig
        .engine
        .resolve_conflict(
            "u1",
            ResolveConflict::new(EntityType::Alert, "a1", ResolutionStrategy::ClientWins),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, ResolveOutcome::RefreshRequired { .. }));
    assert!(rig.engine.list_conflicts("u1").is_empty());
    assert!(rig.engine.reset());

    // The stale local copy stays unsynced until the refresh replaces it.
    let stale = rig.store.get_entity_row(EntityType::Alert, "a1").unwrap();
    assert!(!stale.is_synced());
    assert_eq!(stale.get_str("severity"), Some("high"));

    let report = rig.engine.pull_only("u1").await.unwrap();
    assert_eq!(report.conflicts(), 0);
    let fresh = rig.store.get_entity_row(EntityType::Alert, "a1").unwrap();
    assert_eq!(fresh.get_str("severity"), Some("medium"));
    assert!(fresh.is_synced());
    assert!(rig.is_converged());
}

#[tokio::test]
async fn pull_merges_without_touching_unsynced_rows() {
    let rig = TestRig::new("u1");
    rig.server
        .seed(EntityType::Location, json!({"id": "l1", "name": "Server name"}));
    rig.server
        .seed(EntityType::Location, json!({"id": "l2", "name": "Fresh"}));
    rig.create(EntityType::Location, json!({"id": "l1", "name": "Local name"}));
    rig.server.set_online(false);
    rig.engine.run_sync("u1").await.unwrap();
    rig.server.set_online(true);

    let report = rig.engine.pull_only("u1").await.unwrap();
    assert_eq!(report.inserted(), 1);
    assert_eq!(report.conflicts(), 1);
    let l1 = rig.store.get_entity_row(EntityType::Location, "l1").unwrap();
    assert_eq!(l1.get_str("name"), Some("Local name"));
    assert!(!l1.is_synced());
    // The protected row produced a notification for the signed-in user.
    assert_eq!(rig.store.rows(EntityType::Notification).len(), 1);
}

#[tokio::test]
async fn newer_side_wins_on_pull() {
    let rig = TestRig::new("u1");
    rig.store
        .transaction(|txn| {
            txn.insert_row(
                EntityType::Task,
                row(json!({"id": "old", "title": "A", "updated_at": "2024-01-01T00:00:00Z", "synced": 1})),
            )?;
            txn.insert_row(
                EntityType::Task,
                row(json!({"id": "new", "title": "B", "updated_at": "2024-06-01T00:00:00Z", "synced": 1})),
            )?;
            txn.insert_row(
                EntityType::Task,
                row(json!({"id": "tie", "title": "C", "updated_at": "2024-03-01T00:00:00Z", "synced": 1})),
            )
        })
        .unwrap();
    rig.server.seed(
        EntityType::Task,
        json!({"id": "old", "title": "A2", "updated_at": "2024-02-01T00:00:00Z"}),
    );
    rig.server.seed(
        EntityType::Task,
        json!({"id": "new", "title": "B2", "updated_at": "2024-05-01T00:00:00Z"}),
    );
    rig.server.seed(
        EntityType::Task,
        json!({"id": "tie", "title": "C2", "updated_at": "2024-03-01T00:00:00Z"}),
    );

    rig.engine.pull_only("u1").await.unwrap();
    let title = |id: &str| {
        rig.store
            .get_entity_row(EntityType::Task, id)
            .unwrap()
            .get_str("title")
            .map(str::to_string)
    };
    assert_eq!(title("old").as_deref(), Some("A2"));
    assert_eq!(title("new").as_deref(), Some("B"));
    assert_eq!(title("tie").as_deref(), Some("C2"));
}

#[tokio::test]
async fn fuzzy_duplicate_supply_adopts_server_id() {
    let rig = TestRig::new("u1");
    rig.store
        .transaction(|txn| {
            txn.insert_row(
                EntityType::Supply,
                row(json!({"id": "dev-7", "name": "Sterile gauze", "synced": 1})),
            )?;
            txn.insert_row(
                EntityType::Task,
                row(json!({"id": "t1", "supply_id": "dev-7", "synced": 1})),
            )
        })
        .unwrap();
    rig.server
        .seed(EntityType::Supply, json!({"id": "srv-40", "name": "Sterile Gauze"}));

    let report = rig.engine.pull_only("u1").await.unwrap();
    assert_eq!(report.duplicates_resolved(), 1);
    assert_eq!(rig.store.rows(EntityType::Supply).len(), 1);
    let task = rig.store.get_entity_row(EntityType::Task, "t1").unwrap();
    assert_eq!(task.get_str("supply_id"), Some("srv-40"));
}

#[tokio::test]
async fn remap_retargets_duplicate_notification() {
    let rig = TestRig::new("u1");
    rig.server.seed(
        EntityType::Supply,
        json!({"id": "srv-40", "name": "Gauze pad", "location_id": "l1"}),
    );
    rig.create(
        EntityType::Supply,
        json!({"id": "local-1", "name": "Gauze pads", "location_id": "l1"}),
    );

    let report = rig.engine.pull_only("u1").await.unwrap();
    assert_eq!(report.conflicts(), 1);
    assert_eq!(report.duplicates_resolved(), 1);
    let notes = rig.store.rows(EntityType::Notification);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].get_str("entity_id"), Some("local-1"));

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.remapped, 1);
    let server_id = rig.server.accepted()[0].2.clone();
    let notes = rig.store.rows(EntityType::Notification);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].get_str("entity_type"), Some("supply"));
    assert_eq!(notes[0].get_str("entity_id"), Some(server_id.as_str()));
    assert!(rig.store.get_entity_row(EntityType::Supply, &server_id).is_some());
}

fn rename_supply_during_next_push(rig: &TestRig, id: &'static str, name: &'static str, advance: bool) {
    let store = rig.store.clone();
    let clock = rig.clock.clone();
    let actor = rig.actor.clone();
    rig.server.on_next_push(move || {
        if advance {
            clock.advance(chrono::Duration::seconds(5));
        }
        let mut fields = serde_json::Map::new();
        fields.insert("name".into(), json!(name));
        store
            .record_local_update(EntityType::Supply, id, fields, &actor, clock.now())
            .unwrap();
    });
}

async fn edit_during_push_is_pushed_next_run(advance: bool) {
    let rig = TestRig::new("u1");
    rig.create(EntityType::Supply, json!({"id": "local-1", "name": "Gauze"}));
    rename_supply_during_next_push(&rig, "local-1", "Gauze pads", advance);

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.remapped, 1);
    assert_eq!(report.push.succeeded, 0);
    assert_eq!(report.push.requeued, 1);
    assert!(!report.is_fully_successful());
    assert_eq!(rig.server.row(EntityType::Supply, "srv-1").unwrap()["name"], "Gauze");

    let pending = rig.store.pending_outbox_entries("u1");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "srv-1");
    let local = rig.store.get_entity_row(EntityType::Supply, "srv-1").unwrap();
    assert!(!local.is_synced());
    assert_eq!(local.get_str("name"), Some("Gauze pads"));

    let report = rig.engine.run_sync("u1").await.unwrap();
    assert_eq!(report.push.succeeded, 1);
    assert_eq!(rig.server.row(EntityType::Supply, "srv-1").unwrap()["name"], "Gauze pads");
    assert_eq!(rig.server.accepted().len(), 2);
    assert!(rig.store.get_entity_row(EntityType::Supply, "srv-1").unwrap().is_synced());
    assert!(rig.store.pending_outbox_entries("u1").is_empty());
}

#[tokio::test]
async fn edit_during_push_with_same_timestamp_is_not_lost() {
    edit_during_push_is_pushed_next_run(false).await;
}

#[tokio::test]
async fn edit_during_push_with_later_timestamp_is_not_lost() {
    edit_during_push_is_pushed_next_run(true).await;
}

#[tokio::test]
async fn bulk_pull_fetches_every_collection_at_once() {
    let rig = TestRig::with_config("u1", test_config().with_bulk_pull(true));
    rig.server
        .seed(EntityType::Location, json!({"id": "l1", "name": "Clinic"}));
    rig.server.seed(
        EntityType::Supply,
        json!({"id": "s1", "name": "Gauze", "location_id": "l1"}),
    );

    let report = rig.engine.pull_only("u1").await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.inserted(), 2);
    assert_eq!(rig.server.pull_count(), 1);
    assert_eq!(rig.server.bulk_pull_count(), 1);
    assert!(rig.is_converged());
}

#[tokio::test]
async fn identity_duplicate_moves_the_session() {
    let rig = TestRig::new("local-u");
    rig.store
        .transaction(|txn| {
            txn.insert_row(
                EntityType::User,
                row(json!({"id": "local-u", "email": "Nurse@Example.org", "synced": 1})),
            )
        })
        .unwrap();
    rig.server.seed(
        EntityType::User,
        json!({"id": "srv-u", "email": "nurse@example.org", "name": "Nurse"}),
    );

    rig.engine.pull_only("local-u").await.unwrap();
    assert_eq!(rig.store.session().unwrap().user_id, "srv-u");
    assert!(rig.store.get_entity_row(EntityType::User, "local-u").is_none());
    let user = rig.store.get_entity_row(EntityType::User, "srv-u").unwrap();
    assert_eq!(user.get_str("name"), Some("Nurse"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn offline_sessions_converge(session in offline_session_strategy(24)) {
        let rig = TestRig::new("u1");
        let applied = apply_offline_session(&rig.store, "u1", &session, fixed_now()).unwrap();

        let rt = runtime();
        let report = rt.block_on(rig.engine.run_sync("u1")).unwrap();
        prop_assert!(report.is_fully_successful());
        prop_assert!(rig.is_converged());
        prop_assert_eq!(report.push.succeeded, applied.created.len());

        // No local id survives anywhere once every row was accepted.
        for et in [EntityType::Location, EntityType::Supply, EntityType::Task] {
            for row in rig.store.rows(et) {
                let text = row.to_wire().to_string();
                prop_assert!(!text.contains("local-"), "{} still references a local id: {}", et, text);
            }
        }

        let pushes = rig.server.push_count();
        let outbox = rig.store.outbox_entries().len();
        let again = rt.block_on(rig.engine.run_sync("u1")).unwrap();
        prop_assert_eq!(again.push.attempted, 0);
        prop_assert_eq!(rig.server.push_count(), pushes);
        prop_assert_eq!(rig.store.outbox_entries().len(), outbox);
    }
}
