//! Operator backup flows against a file-backed store.

use chrono::Utc;
use portal_core::backup::{backup_file_name, RestoreOptions};
use portal_core::config::PortalConfig;
use portal_core::event_log::{EventLog, BACKUP_EXPORTED, RESTORE_COMPLETED, RESTORE_REJECTED};
use portal_core::store::{DocumentStore, Fields, FileStore};
use portal_service::operations::{download_backup, restore_summary, upload_and_restore};
use serde_json::{json, Value};
use std::fs;
use tempfile::tempdir;

fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn download_then_upload_into_fresh_store() {
    let dir = tempdir().unwrap();
    let config = PortalConfig::load_or_create(dir.path()).unwrap();
    let events = EventLog::new(config.event_log_path(), 1 << 20).unwrap();

    let source = FileStore::open(&config.store_dir).unwrap();
    source
        .set("workshops", "ai-101", fields(json!({"title": "Intro to AI", "seats": 40})))
        .await
        .unwrap();
    source
        .set("inquiries", "q1", fields(json!({"email": "parent@mail.test", "resolved": false})))
        .await
        .unwrap();

    let outcome = download_backup(&source, &config, None, Some(&events))
        .await
        .unwrap();
    assert_eq!(outcome.summary.total, 2);
    assert_eq!(
        outcome.path,
        config.backup_dir.join(backup_file_name(Utc::now().date_naive()))
    );

    let written: Value = serde_json::from_str(&fs::read_to_string(&outcome.path).unwrap()).unwrap();
    assert_eq!(written["metadata"]["exportedBy"], json!("admin"));
    assert_eq!(written["metadata"]["clientId"], json!(config.client_id));

    let target = FileStore::open(dir.path().join("restored")).unwrap();
    let report = upload_and_restore(
        &target,
        &outcome.path,
        &RestoreOptions::default(),
        None,
        Some(&events),
    )
    .await
    .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.restored, 2);
    assert_eq!(
        target.get("workshops", "ai-101").await.unwrap().unwrap().fields,
        fields(json!({"title": "Intro to AI", "seats": 40}))
    );

    let mut types: Vec<String> = events
        .read_recent(None, None)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    types.reverse();
    assert_eq!(types, vec![BACKUP_EXPORTED, RESTORE_COMPLETED]);
}

#[tokio::test]
async fn rejected_upload_is_audited_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let events = EventLog::new(dir.path().join("events.log"), 1 << 20).unwrap();
    let store = FileStore::open(dir.path().join("store")).unwrap();
    let file = dir.path().join("bad.json");
    fs::write(&file, r#"{"users": [{"id": "u1", "name": "x"}]}"#).unwrap();

    let err = upload_and_restore(&store, &file, &RestoreOptions::default(), None, Some(&events))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("collections"));
    assert!(store.collection_names().await.unwrap().is_empty());

    let recent = events.read_recent(None, Some(1)).unwrap();
    assert_eq!(recent[0].event_type, RESTORE_REJECTED);
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = tempdir().unwrap();
    let store = FileStore::open(dir.path().join("store")).unwrap();
    let result = upload_and_restore(
        &store,
        &dir.path().join("nope.json"),
        &RestoreOptions::default(),
        None,
        None,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn explicit_out_dir_wins_over_config() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("usb");
    let config = PortalConfig::load_or_create(dir.path()).unwrap();
    let store = FileStore::open(&config.store_dir).unwrap();

    let outcome = download_backup(&store, &config, Some(out.as_path()), None)
        .await
        .unwrap();
    assert!(outcome.path.starts_with(&out));
    assert_eq!(outcome.summary.total, 0);

    let report = upload_and_restore(&store, &outcome.path, &RestoreOptions::default(), None, None)
        .await
        .unwrap();
    assert_eq!(
        restore_summary(&report),
        "restored 0 documents across 17 collections"
    );
}
