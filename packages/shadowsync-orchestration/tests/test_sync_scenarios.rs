//! Integration tests for day-over-day synchronization
//!
//! Runs the full pipeline on the demo lab mapping:
//! - initial population of shadow, membership and real tables
//! - in-place updates that keep the real row identity
//! - parent changes reaching the real rows that copy parent columns
//! - UUID keys in any letter case
//! - idempotent re-runs
//! - dependencies that resolve on a later day
//! - deletion cascades and referential violations

mod common;

use common::*;
use serde_json::{json, Value};
use shadowsync_orchestration::{SnapshotRecord, Stage};
use shadowsync_storage::{RawStore, SqlValue};
use uuid::Uuid;

const DATASET_2: &str = "50000000-0000-4000-8000-000000000002";

#[test]
fn test_initial_sync_populates_every_table() {
    let orch = orchestrator();
    let report = run(&orch, 1, population());

    assert_eq!(report.diff_summary, "+7 ~0 (important 0) -0");
    assert_eq!(report.stage(Stage::IngestRaw).unwrap().ingested, 7);
    assert_eq!(report.stage(Stage::PopulateShadow).unwrap().ingested, 7);
    assert_eq!(report.stage(Stage::PopulateMembership).unwrap().ingested, 3);

    for (table, expected) in [
        ("lab", 1),
        ("user", 2),
        ("subject", 2),
        ("session", 1),
        ("dataset", 1),
        ("subject_user", 3),
    ] {
        assert_eq!(real_rows(&orch, table).len(), expected, "real {}", table);
        assert_eq!(shadow_rows(&orch, table).len(), expected, "shadow {}", table);
    }

    let subject = &real_rows(&orch, "subject")[0];
    assert_eq!(subject.get("lab_name"), Some(&SqlValue::text("cortexlab")));
    assert_eq!(subject.get("sex"), Some(&SqlValue::text("F")));

    let user = &real_rows(&orch, "user")[0];
    assert_eq!(user.get("email"), Some(&SqlValue::Null));

    let session = &real_rows(&orch, "session")[0];
    assert_eq!(session.get("session_number"), Some(&SqlValue::Integer(1)));
}

#[test]
fn test_foreign_key_change_updates_real_row_in_place() {
    let orch = orchestrator();
    run(&orch, 1, population());

    let filter = by_key("session_uuid", SESSION_1);
    let rowid = orch.store().rowid_of("session", &filter).unwrap();
    assert!(rowid.is_some());

    // the session moves to the other subject
    let mut records = population();
    records[5] = session(SESSION_1, SUBJECT_2, json!(1));
    let report = run(&orch, 2, records);

    assert_eq!(report.diff_summary, "+0 ~1 (important 1) -0");
    assert_eq!(report.stage(Stage::UpdateFields).unwrap().ingested, 1);
    assert_eq!(orch.store().rowid_of("session", &filter).unwrap(), rowid);

    let sessions = real_rows(&orch, "session");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].get("subject_uuid"), Some(&SqlValue::text(SUBJECT_2)));

    // the dataset below the session was not touched in the real layer
    let datasets = real_rows(&orch, "dataset");
    assert_eq!(datasets.len(), 1);
    assert_eq!(datasets[0].get("session_uuid"), Some(&SqlValue::text(SESSION_1)));
    assert_eq!(shadow_rows(&orch, "dataset").len(), 1);
}

#[test]
fn test_parent_rename_reaches_real_child_rows() {
    let orch = orchestrator();
    run(&orch, 1, population());
    let session_filter = by_key("session_uuid", SESSION_1);
    let session_rowid = orch.store().rowid_of("session", &session_filter).unwrap();
    let dataset_rowid = orch
        .store()
        .rowid_of("dataset", &by_key("dataset_uuid", DATASET_1))
        .unwrap();

    let mut records = population();
    records[3] = subject(SUBJECT_1, "ZM_1b", &[USER_A]);
    let report = run(&orch, 2, records);
    assert_eq!(report.diff_summary, "+0 ~1 (important 1) -0");
    assert_eq!(report.total_failed_writes(), 0);

    let sessions = real_rows(&orch, "session");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].get("subject_nickname"), Some(&SqlValue::text("ZM_1b")));
    assert_eq!(orch.store().rowid_of("session", &session_filter).unwrap(), session_rowid);
    assert_eq!(
        orch.store()
            .rowid_of("dataset", &by_key("dataset_uuid", DATASET_1))
            .unwrap(),
        dataset_rowid
    );
    assert_eq!(real_rows(&orch, "subject_user").len(), 3);
}

#[test]
fn test_parent_key_change_keeps_real_descendants() {
    let orch = orchestrator();
    run(&orch, 1, population());
    let subject_rowid = orch
        .store()
        .rowid_of("subject", &by_key("subject_uuid", SUBJECT_1))
        .unwrap();
    let session_rowid = orch
        .store()
        .rowid_of("session", &by_key("session_uuid", SESSION_1))
        .unwrap();

    // the lab is keyed by its name
    let mut records = population();
    records[0] = record(LAB, "lab", json!({"name": "cortexlab2", "institution": "UCL"}));
    let report = run(&orch, 2, records);
    assert_eq!(report.diff_summary, "+0 ~1 (important 1) -0");
    assert_eq!(report.total_failed_writes(), 0);

    let labs = real_rows(&orch, "lab");
    assert_eq!(labs.len(), 1);
    assert_eq!(labs[0].get("lab_name"), Some(&SqlValue::text("cortexlab2")));

    let subjects = real_rows(&orch, "subject");
    assert_eq!(subjects.len(), 2);
    assert!(subjects
        .iter()
        .all(|row| row.get("lab_name") == Some(&SqlValue::text("cortexlab2"))));
    assert_eq!(
        orch.store()
            .rowid_of("subject", &by_key("subject_uuid", SUBJECT_1))
            .unwrap(),
        subject_rowid
    );
    assert_eq!(
        orch.store()
            .rowid_of("session", &by_key("session_uuid", SESSION_1))
            .unwrap(),
        session_rowid
    );
    assert_eq!(real_rows(&orch, "subject_user").len(), 3);
}

/// Same records with every UUID written in upper case.
fn upper_case_uuids(records: Vec<SnapshotRecord>) -> Vec<SnapshotRecord> {
    fn shout(value: &mut Value) {
        match value {
            Value::String(s) if Uuid::parse_str(s).is_ok() => *s = s.to_uppercase(),
            Value::Array(items) => items.iter_mut().for_each(shout),
            _ => {}
        }
    }
    records
        .into_iter()
        .map(|mut record| {
            record.pk = record.pk.to_uppercase();
            record.fields.values_mut().for_each(shout);
            record
        })
        .collect()
}

#[test]
fn test_upper_case_uuids_sync_and_stay_stable() {
    let orch = orchestrator();
    let report = run(&orch, 1, upper_case_uuids(population()));
    assert_eq!(report.diff_summary, "+7 ~0 (important 0) -0");
    assert_eq!(report.stage(Stage::PopulateShadow).unwrap().ingested, 7);
    let rowid = orch
        .store()
        .rowid_of("subject", &by_key("subject_uuid", SUBJECT_1))
        .unwrap();
    assert!(rowid.is_some());

    let report = run(&orch, 2, upper_case_uuids(population()));
    assert_eq!(report.diff_summary, "+0 ~0 (important 0) -0");

    for (table, expected) in [
        ("lab", 1),
        ("user", 2),
        ("subject", 2),
        ("session", 1),
        ("dataset", 1),
        ("subject_user", 3),
    ] {
        assert_eq!(real_rows(&orch, table).len(), expected, "real {}", table);
    }
    assert_eq!(
        orch.store()
            .rowid_of("subject", &by_key("subject_uuid", SUBJECT_1))
            .unwrap(),
        rowid
    );
}

#[test]
fn test_same_snapshot_next_day_changes_nothing() {
    let orch = orchestrator();
    run(&orch, 1, population());
    let rowid = orch
        .store()
        .rowid_of("subject", &by_key("subject_uuid", SUBJECT_2))
        .unwrap();

    let report = run(&orch, 2, population());
    assert_eq!(report.diff_summary, "+0 ~0 (important 0) -0");
    assert_eq!(report.stage(Stage::PopulateShadow).unwrap().ingested, 0);
    assert_eq!(report.stage(Stage::SyncReal).unwrap().ingested, 0);
    assert_eq!(report.total_failed_writes(), 0);

    assert_eq!(real_rows(&orch, "subject_user").len(), 3);
    assert_eq!(
        orch.store()
            .rowid_of("subject", &by_key("subject_uuid", SUBJECT_2))
            .unwrap(),
        rowid
    );
}

#[test]
fn test_missing_dependency_resolves_when_it_appears() {
    let orch = orchestrator();
    let mut records = population();
    records.push(dataset(DATASET_2, SESSION_9));
    let report = run(&orch, 1, records.clone());

    let shadow = report.stage(Stage::PopulateShadow).unwrap();
    assert_eq!(shadow.skipped_dependency, 1);
    assert_eq!(shadow.skipped_integrity, 0);
    // missing dependencies are retried, not listed as failures
    assert!(shadow.failures.is_empty());
    assert_eq!(real_rows(&orch, "dataset").len(), 1);

    records.push(session(SESSION_9, SUBJECT_2, json!(2)));
    let report = run(&orch, 2, records);
    assert_eq!(report.diff_summary, "+1 ~0 (important 0) -0");
    assert_eq!(report.stage(Stage::PopulateShadow).unwrap().skipped_dependency, 0);

    let datasets = real_rows(&orch, "dataset");
    assert_eq!(datasets.len(), 2);
    assert!(datasets
        .iter()
        .any(|row| row.get("session_uuid") == Some(&SqlValue::text(SESSION_9))));
}

#[test]
fn test_deleted_subject_removes_its_rows_everywhere() {
    let orch = orchestrator();
    run(&orch, 1, population());

    let records: Vec<_> = population()
        .into_iter()
        .filter(|r| ![SUBJECT_1, SESSION_1, DATASET_1].contains(&r.pk.as_str()))
        .collect();
    let report = run(&orch, 2, records);
    assert_eq!(report.diff_summary, "+0 ~0 (important 0) -3");

    for (table, expected) in [
        ("subject", 1),
        ("session", 0),
        ("dataset", 0),
        ("subject_user", 2),
    ] {
        assert_eq!(real_rows(&orch, table).len(), expected, "real {}", table);
        assert_eq!(shadow_rows(&orch, table).len(), expected, "shadow {}", table);
    }

    let id = Uuid::parse_str(SUBJECT_1).unwrap();
    assert_eq!(orch.store().entity_type_of(id).unwrap(), None);
}

#[test]
fn test_reference_to_deleted_entity_is_referential_violation() {
    let orch = orchestrator();
    run(&orch, 1, population());

    // the subject disappears upstream, its session does not
    let records: Vec<_> = population()
        .into_iter()
        .filter(|r| r.pk != SUBJECT_1)
        .collect();
    let report = run(&orch, 2, records.clone());

    let shadow = report.stage(Stage::PopulateShadow).unwrap();
    assert_eq!(shadow.skipped_referential, 1);
    assert!(shadow
        .failures
        .iter()
        .any(|f| f.key == SESSION_1 && f.kind == "referential_violation"));

    assert!(real_rows(&orch, "session").is_empty());
    assert!(real_rows(&orch, "dataset").is_empty());
    assert_eq!(real_rows(&orch, "subject").len(), 1);

    // the deletion is history now; the session is still an orphan
    let report = run(&orch, 3, records);
    assert_eq!(report.diff_summary, "+0 ~0 (important 0) -0");
    let shadow = report.stage(Stage::PopulateShadow).unwrap();
    assert_eq!(shadow.skipped_referential, 1);
    assert_eq!(shadow.skipped_dependency, 1);
    assert!(shadow
        .failures
        .iter()
        .any(|f| f.key == SESSION_1 && f.kind == "referential_violation"));
}

#[test]
fn test_unimportant_change_only_refreshes_raw_fields() {
    let orch = orchestrator();
    run(&orch, 1, population());
    let filter = by_key("session_uuid", SESSION_1);
    let rowid = orch.store().rowid_of("session", &filter).unwrap();

    let mut records = population();
    records[5] = session(SESSION_1, SUBJECT_1, json!(1)).with_field("narrative", json!("late start"));
    let report = run(&orch, 2, records);

    assert_eq!(report.diff_summary, "+0 ~1 (important 0) -0");
    assert_eq!(report.stage(Stage::UpdateFields).unwrap().ingested, 0);
    assert_eq!(orch.store().rowid_of("session", &filter).unwrap(), rowid);
    assert_eq!(shadow_rows(&orch, "dataset").len(), 1);

    let entity = orch
        .store()
        .load_entity(Uuid::parse_str(SESSION_1).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(entity.list("narrative").unwrap(), vec!["late start"]);
    assert_eq!(entity.list("subject").unwrap(), vec![SUBJECT_1]);
}

#[test]
fn test_excluded_table_is_left_empty() {
    let config = config().exclude_tables(["dataset"]);
    let orch = orchestrator_with(shadowsync_storage::SqliteStore::in_memory().unwrap(), config);
    run(&orch, 1, population());

    assert!(real_rows(&orch, "dataset").is_empty());
    assert!(shadow_rows(&orch, "dataset").is_empty());
    assert_eq!(real_rows(&orch, "session").len(), 1);
}

#[test]
fn test_run_survives_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");

    {
        let store = shadowsync_storage::SqliteStore::open(&path).unwrap();
        let orch = orchestrator_with(store, config());
        run(&orch, 1, population());
    }

    let store = shadowsync_storage::SqliteStore::open(&path).unwrap();
    let orch = orchestrator_with(store, config());
    // same day again: the recorded job is complete
    let report = run(&orch, 1, population());
    assert!(report.stages.is_empty());
    assert_eq!(report.skipped_stages.len(), Stage::ALL.len());

    // the previous state now comes from the raw store
    let mut records = population();
    records[3] = subject(SUBJECT_1, "ZM_1b", &[USER_A]);
    let report = run(&orch, 2, records);
    assert_eq!(report.diff_summary, "+0 ~1 (important 1) -0");
    let subject = orch
        .store()
        .select_rows(
            orch.catalog().schema("subject").unwrap(),
            "subject",
            &by_key("subject_uuid", SUBJECT_1),
        )
        .unwrap();
    assert_eq!(subject[0].get("nickname"), Some(&SqlValue::text("ZM_1b")));
}
