//! Shared fixtures: the demo lab mapping and a small lab population.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use shadowsync_orchestration::{
    AggregateRegistry, MappingTable, PipelineConfig, PipelineOrchestrator, RunOptions, RunReport,
    Snapshot, SnapshotRecord, TableCatalog,
};
use shadowsync_storage::{Filter, Row, SqlValue, SqliteStore};
use std::sync::Arc;

pub const MAPPING: &str = include_str!("../../../../demos/mapping.yaml");
pub const CONFIG: &str = include_str!("../../../../demos/config.yaml");

pub const LAB: &str = "10000000-0000-4000-8000-000000000001";
pub const USER_A: &str = "20000000-0000-4000-8000-00000000000a";
pub const USER_B: &str = "20000000-0000-4000-8000-00000000000b";
pub const SUBJECT_1: &str = "30000000-0000-4000-8000-000000000001";
pub const SUBJECT_2: &str = "30000000-0000-4000-8000-000000000002";
pub const SESSION_1: &str = "40000000-0000-4000-8000-000000000001";
pub const SESSION_9: &str = "40000000-0000-4000-8000-000000000009";
pub const DATASET_1: &str = "50000000-0000-4000-8000-000000000001";

pub fn config() -> PipelineConfig {
    PipelineConfig::from_yaml_str(CONFIG).unwrap()
}

pub fn orchestrator_with(store: SqliteStore, config: PipelineConfig) -> PipelineOrchestrator {
    let mapping = MappingTable::from_yaml_str(MAPPING).unwrap();
    let catalog = TableCatalog::from_mapping(&mapping).unwrap();
    let orchestrator =
        PipelineOrchestrator::new(store, config, catalog, Arc::new(AggregateRegistry::new()))
            .unwrap();
    orchestrator.prepare().unwrap();
    orchestrator
}

pub fn orchestrator() -> PipelineOrchestrator {
    orchestrator_with(SqliteStore::in_memory().unwrap(), config())
}

/// Snapshot time on day `day` of March 2024
pub fn day(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 6, 0, 0).unwrap()
}

pub fn record(pk: &str, entity_type: &str, fields: Value) -> SnapshotRecord {
    let mut record = SnapshotRecord::new(pk, entity_type);
    if let Value::Object(map) = fields {
        for (name, value) in map {
            record = record.with_field(name, value);
        }
    }
    record
}

pub fn lab() -> SnapshotRecord {
    record(LAB, "lab", json!({"name": "cortexlab", "institution": "UCL"}))
}

pub fn user(pk: &str, username: &str) -> SnapshotRecord {
    record(pk, "user", json!({"username": username, "email": null}))
}

pub fn subject(pk: &str, nickname: &str, users: &[&str]) -> SnapshotRecord {
    record(
        pk,
        "subject",
        json!({"nickname": nickname, "lab": LAB, "sex": "F", "responsible_user": users}),
    )
}

pub fn session(pk: &str, subject: &str, number: Value) -> SnapshotRecord {
    record(
        pk,
        "session",
        json!({
            "subject": subject,
            "start_time": "2024-02-28T10:15:00",
            "number": number,
            "task_protocol": "biasedChoiceWorld",
            "narrative": "",
        }),
    )
}

pub fn dataset(pk: &str, session: &str) -> SnapshotRecord {
    record(
        pk,
        "dataset",
        json!({"session": session, "name": "trials.table.pqt", "file_size": 5120}),
    )
}

/// Lab, two users, two subjects, one session with one dataset.
pub fn population() -> Vec<SnapshotRecord> {
    vec![
        lab(),
        user(USER_A, "alice"),
        user(USER_B, "bob"),
        subject(SUBJECT_1, "ZM_1", &[USER_A]),
        subject(SUBJECT_2, "ZM_2", &[USER_A, USER_B]),
        session(SESSION_1, SUBJECT_1, json!(1)),
        dataset(DATASET_1, SESSION_1),
    ]
}

pub fn snapshot(on: u32, records: Vec<SnapshotRecord>) -> Snapshot {
    Snapshot::new(day(on), records)
}

pub fn run(orchestrator: &PipelineOrchestrator, on: u32, records: Vec<SnapshotRecord>) -> RunReport {
    orchestrator
        .run_once(&snapshot(on, records), None, &RunOptions::default())
        .unwrap()
}

pub fn rows(orchestrator: &PipelineOrchestrator, physical: &str, table: &str) -> Vec<Row> {
    let schema = orchestrator.catalog().schema(table).unwrap();
    orchestrator
        .store()
        .select_rows(schema, physical, &Vec::new())
        .unwrap()
}

pub fn real_rows(orchestrator: &PipelineOrchestrator, table: &str) -> Vec<Row> {
    rows(orchestrator, table, table)
}

pub fn shadow_rows(orchestrator: &PipelineOrchestrator, table: &str) -> Vec<Row> {
    let physical = format!("{}{}", orchestrator.config().table_prefix, table);
    rows(orchestrator, &physical, table)
}

pub fn by_key(column: &str, value: &str) -> Filter {
    vec![(column.to_string(), SqlValue::text(value))]
}
