//! Property tests for the snapshot differ

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use shadowsync_orchestration::{
    ImportanceConfig, ImportanceFilter, Snapshot, SnapshotDiffer, SnapshotRecord,
};
use shadowsync_storage::NormalizeOptions;
use std::collections::{BTreeMap, BTreeSet};

fn differ() -> SnapshotDiffer {
    SnapshotDiffer::new(NormalizeOptions::default(), ImportanceFilter::default())
}

fn pk(i: u8) -> String {
    format!("00000000-0000-4000-8000-{:012x}", i)
}

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (0i64..5).prop_map(|n| json!(n)),
        "[a-c]{0,2}".prop_map(Value::String),
        prop::collection::vec("[a-c]{1,2}", 0..3).prop_map(|v| json!(v)),
    ]
}

fn record() -> impl Strategy<Value = SnapshotRecord> {
    (
        0u8..16,
        prop::sample::select(vec!["subject", "session"]),
        prop::collection::btree_map("[xyz]", value(), 0..3),
    )
        .prop_map(|(i, entity_type, fields)| {
            let mut record = SnapshotRecord::new(pk(i), entity_type);
            record.fields = fields;
            record
        })
}

fn snapshot(day: u32, records: Vec<SnapshotRecord>) -> Snapshot {
    Snapshot::new(Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(), records)
}

fn keys(snapshot: &Snapshot) -> BTreeSet<String> {
    snapshot.keys().cloned().collect()
}

proptest! {
    #[test]
    fn diff_against_itself_is_empty(records in prop::collection::vec(record(), 0..20)) {
        let s = snapshot(1, records);
        prop_assert!(differ().diff(&s, &s).is_empty());
    }

    #[test]
    fn key_sets_partition(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20),
    ) {
        let (old, new) = (snapshot(1, old), snapshot(2, new));
        let diff = differ().diff(&old, &new);
        let (old_keys, new_keys) = (keys(&old), keys(&new));

        let created: BTreeSet<String> = new_keys.difference(&old_keys).cloned().collect();
        let deleted: BTreeSet<String> = old_keys.difference(&new_keys).cloned().collect();
        prop_assert_eq!(&diff.created, &created);
        prop_assert_eq!(&diff.deleted, &deleted);

        let common: BTreeSet<String> = old_keys.intersection(&new_keys).cloned().collect();
        prop_assert!(diff.modified.is_subset(&common));
        prop_assert!(diff.modified_important.is_subset(&diff.modified));
    }

    #[test]
    fn change_classes_are_disjoint(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20),
    ) {
        let diff = differ().diff(&snapshot(1, old), &snapshot(2, new));
        prop_assert!(diff.created.is_disjoint(&diff.deleted));
        prop_assert!(diff.modified.is_disjoint(&diff.created));
        prop_assert!(diff.modified.is_disjoint(&diff.deleted));
    }

    #[test]
    fn diff_is_deterministic(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20),
    ) {
        let (old, new) = (snapshot(1, old), snapshot(2, new));
        prop_assert_eq!(differ().diff(&old, &new), differ().diff(&old, &new));
    }

    #[test]
    fn pk_letter_case_does_not_matter(records in prop::collection::vec(record(), 0..20)) {
        let shouted: Vec<SnapshotRecord> = records
            .iter()
            .cloned()
            .map(|mut r| {
                r.pk = r.pk.to_uppercase();
                r
            })
            .collect();
        let diff = differ().diff(&snapshot(1, records), &snapshot(2, shouted));
        prop_assert!(diff.is_empty());
    }

    #[test]
    fn modified_means_normalized_fields_differ(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20),
    ) {
        let (old, new) = (snapshot(1, old), snapshot(2, new));
        let differ = differ();
        let diff = differ.diff(&old, &new);
        for record in new.records() {
            if let Some(previous) = old.get(&record.pk) {
                let changed = !differ.changed_fields(previous, record).is_empty()
                    || previous.entity_type != record.entity_type;
                prop_assert_eq!(diff.modified.contains(&record.pk), changed, "pk {}", record.pk);
            }
        }
    }

    #[test]
    fn diff_ignores_record_order(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20).prop_shuffle(),
    ) {
        // duplicates resolve to the last record, so keep one record per pk
        let dedup = |records: Vec<SnapshotRecord>| -> Vec<SnapshotRecord> {
            let by_pk: BTreeMap<String, SnapshotRecord> =
                records.into_iter().map(|r| (r.pk.clone(), r)).collect();
            by_pk.into_values().collect()
        };
        let old = snapshot(1, dedup(old));
        let new = dedup(new);
        let mut reversed = new.clone();
        reversed.reverse();

        let forward = differ().diff(&old, &snapshot(2, new));
        let backward = differ().diff(&old, &snapshot(2, reversed));
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn ignored_types_are_never_important(
        old in prop::collection::vec(record(), 0..20),
        new in prop::collection::vec(record(), 0..20),
    ) {
        let mut config = ImportanceConfig::default();
        config.ignored_types.insert("session".to_string());
        let differ = SnapshotDiffer::new(NormalizeOptions::default(), ImportanceFilter::new(config));

        let (old, new) = (snapshot(1, old), snapshot(2, new));
        let diff = differ.diff(&old, &new);
        for pk in &diff.modified_important {
            let (before, after) = (old.get(pk).unwrap(), new.get(pk).unwrap());
            prop_assert!(
                after.entity_type != "session" || before.entity_type != after.entity_type
            );
        }
    }
}

#[test]
fn test_null_and_empty_string_are_the_same_value() {
    let old = snapshot(
        1,
        vec![SnapshotRecord::new(pk(1), "subject").with_field("x", Value::Null)],
    );
    let new = snapshot(
        2,
        vec![SnapshotRecord::new(pk(1), "subject").with_field("x", json!(""))],
    );
    assert!(differ().diff(&old, &new).is_empty());
}
