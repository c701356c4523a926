//! JSON backup and restore of the portal's document collections.
//!
//! Export walks a fixed list of collections and snapshots every document
//! (id + fields) into one [`BackupManifest`]. Restore replays a manifest as
//! per-document upserts keyed by the original id, so replaying the same file
//! twice is harmless.
//!
//! Restore is not transactional. Documents written before a failure or a
//! cancellation stay written; failures are collected per document instead of
//! aborting the run.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::BackupError;
use crate::store::{DocumentStore, Fields};

pub const BACKUP_FORMAT_VERSION: u32 = 1;
pub const BACKUP_FILE_PREFIX: &str = "portal-backup";

/// Collections included in every backup. Anything else in the store is left
/// out; keep this list in step with the schema.
pub const BACKUP_COLLECTIONS: &[&str] = &[
    "users",
    "events",
    "eventCategories",
    "topStudents",
    "admissionsContent",
    "pageContent",
    "inquiries",
    "subscribers",
    "settings",
    "activityLogs",
    "adminSessions",
    "news",
    "workshops",
    "placements",
    "courses",
    "systemLogs",
    "analytics",
];

pub fn is_listed_collection(name: &str) -> bool {
    BACKUP_COLLECTIONS.contains(&name)
}

/// Informational header. Restore never depends on it: unreadable fields fall
/// back to defaults instead of rejecting the file.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub exported_at: Option<DateTime<Utc>>,
    pub exported_by: String,
    pub product: String,
    pub client_id: String,
    pub format_version: u32,
}

impl Default for BackupMetadata {
    fn default() -> Self {
        Self {
            exported_at: None,
            exported_by: String::new(),
            product: String::new(),
            client_id: String::new(),
            format_version: BACKUP_FORMAT_VERSION,
        }
    }
}

impl BackupMetadata {
    /// Read whatever fields are usable from a raw metadata object.
    pub fn from_value_lenient(value: &Value) -> Self {
        let mut metadata = Self::default();
        let Some(object) = value.as_object() else {
            warn!("backup metadata is not an object; ignoring it");
            return metadata;
        };
        let text = |key: &str| -> Option<String> {
            match object.get(key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => {
                    warn!(field = key, value = %other, "ignoring unreadable backup metadata field");
                    None
                }
            }
        };

        if let Some(raw) = text("exportedAt") {
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => metadata.exported_at = Some(at.with_timezone(&Utc)),
                Err(err) => warn!(value = %raw, error = %err, "ignoring backup export time"),
            }
        }
        if let Some(by) = text("exportedBy") {
            metadata.exported_by = by;
        }
        if let Some(product) = text("product") {
            metadata.product = product;
        }
        if let Some(client_id) = text("clientId") {
            metadata.client_id = client_id;
        }
        match object.get("formatVersion") {
            None | Some(Value::Null) => {}
            Some(raw) => match raw.as_u64().and_then(|v| u32::try_from(v).ok()) {
                Some(version) => metadata.format_version = version,
                None => warn!(value = %raw, "ignoring backup format version"),
            },
        }
        metadata
    }
}

/// One document: its id plus its fields, flattened into a single object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BackupMetadata>,
    pub collections: IndexMap<String, Vec<BackupRecord>>,
}

/// Wire shape on the way in. Decoded straight from the text so collection
/// order survives; metadata stays raw until it is read leniently.
#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    collections: Option<IndexMap<String, Vec<BackupRecord>>>,
}

impl BackupManifest {
    pub fn document_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> Result<String, BackupError> {
        serde_json::to_string_pretty(self).map_err(BackupError::Serialize)
    }

    /// Parse and validate a backup file without touching any store.
    pub fn parse(json: &str) -> Result<Self, BackupError> {
        let raw: RawManifest = serde_json::from_str(json).map_err(|err| {
            if err.is_data() {
                BackupError::InvalidManifest(err.to_string())
            } else {
                BackupError::Parse(err)
            }
        })?;
        // null counts as missing
        let collections = raw.collections.ok_or(BackupError::MissingCollections)?;
        Ok(Self {
            metadata: raw.metadata.as_ref().map(BackupMetadata::from_value_lenient),
            collections,
        })
    }

    /// Collections in this manifest that are not part of the backup list.
    pub fn unlisted_collections(&self) -> Vec<String> {
        self.collections
            .keys()
            .filter(|name| !is_listed_collection(name))
            .cloned()
            .collect()
    }
}

/// Per-collection record counts reported after an export.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub counts: IndexMap<String, usize>,
    pub total: usize,
    /// Collections found in the store that the backup list does not cover.
    pub skipped_collections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupExport {
    pub manifest: BackupManifest,
    pub summary: ExportSummary,
}

/// Read every listed collection. Any read failure aborts the export.
pub async fn export(
    store: &dyn DocumentStore,
    metadata: BackupMetadata,
) -> Result<BackupExport, BackupError> {
    let mut collections = IndexMap::with_capacity(BACKUP_COLLECTIONS.len());
    let mut summary = ExportSummary::default();

    for name in BACKUP_COLLECTIONS {
        let docs = store
            .list(name)
            .await
            .map_err(|source| BackupError::Store {
                collection: (*name).to_string(),
                source,
            })?;
        let records: Vec<BackupRecord> = docs
            .into_iter()
            .map(|doc| {
                let mut fields = doc.fields;
                if fields.remove("id").is_some() {
                    warn!(
                        collection = *name,
                        id = %doc.id,
                        "dropping field named \"id\" in favor of document id"
                    );
                }
                BackupRecord { id: doc.id, fields }
            })
            .collect();
        debug!(collection = *name, records = records.len(), "collection exported");
        summary.counts.insert((*name).to_string(), records.len());
        summary.total += records.len();
        collections.insert((*name).to_string(), records);
    }

    match store.collection_names().await {
        Ok(names) => {
            summary.skipped_collections = names
                .into_iter()
                .filter(|name| !is_listed_collection(name))
                .collect();
            if !summary.skipped_collections.is_empty() {
                warn!(
                    collections = ?summary.skipped_collections,
                    "store holds collections that are not backed up"
                );
            }
        }
        Err(err) => warn!(error = %err, "cannot list store collections; drift check skipped"),
    }

    info!(total = summary.total, "backup export complete");
    Ok(BackupExport {
        manifest: BackupManifest {
            metadata: Some(metadata),
            collections,
        },
        summary,
    })
}

/// `portal-backup-YYYY-MM-DD.json`
pub fn backup_file_name(date: NaiveDate) -> String {
    format!("{BACKUP_FILE_PREFIX}-{}.json", date.format("%Y-%m-%d"))
}

/// Write the manifest into `dir` under its dated name, replacing atomically.
pub fn write_backup_file(
    dir: &Path,
    manifest: &BackupManifest,
    date: NaiveDate,
) -> Result<PathBuf, BackupError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(backup_file_name(date));
    let json = manifest.to_json()?;
    let mut staging = tempfile::NamedTempFile::new_in(dir)?;
    staging.write_all(json.as_bytes())?;
    staging.as_file().sync_all()?;
    staging.persist(&path).map_err(|err| BackupError::Io(err.error))?;
    Ok(path)
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restore collections outside [`BACKUP_COLLECTIONS`] instead of refusing
    /// the file.
    pub allow_unlisted: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFailure {
    pub collection: String,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored: usize,
    pub collections_touched: usize,
    pub failures: Vec<DocumentFailure>,
    pub cancelled: bool,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreProgress<'a> {
    pub collection: &'a str,
    pub index: usize,
    pub collections: usize,
    pub records: usize,
}

/// Parse `json` and replay it into `store`.
///
/// Nothing is written unless the whole file validates. `cancel` is checked
/// between documents; flipping it to `true` stops the loop and leaves what was
/// already written in place.
pub async fn restore(
    store: &dyn DocumentStore,
    json: &str,
    options: &RestoreOptions,
    cancel: Option<watch::Receiver<bool>>,
    on_progress: Option<&(dyn Fn(RestoreProgress<'_>) + Send + Sync)>,
) -> Result<RestoreReport, BackupError> {
    let manifest = BackupManifest::parse(json)?;
    restore_manifest(store, &manifest, options, cancel, on_progress).await
}

pub async fn restore_manifest(
    store: &dyn DocumentStore,
    manifest: &BackupManifest,
    options: &RestoreOptions,
    cancel: Option<watch::Receiver<bool>>,
    on_progress: Option<&(dyn Fn(RestoreProgress<'_>) + Send + Sync)>,
) -> Result<RestoreReport, BackupError> {
    let unlisted = manifest.unlisted_collections();
    if !unlisted.is_empty() {
        if !options.allow_unlisted {
            return Err(BackupError::UnlistedCollections(unlisted));
        }
        warn!(collections = ?unlisted, "restoring collections outside the backup list");
    }

    let cancelled = || cancel.as_ref().is_some_and(|rx| *rx.borrow());
    let mut report = RestoreReport::default();
    let total_collections = manifest.collections.len();

    'collections: for (index, (name, records)) in manifest.collections.iter().enumerate() {
        if let Some(callback) = on_progress {
            callback(RestoreProgress {
                collection: name,
                index,
                collections: total_collections,
                records: records.len(),
            });
        }
        report.collections_touched += 1;

        for record in records {
            if cancelled() {
                report.cancelled = true;
                break 'collections;
            }
            match store.set(name, &record.id, record.fields.clone()).await {
                Ok(()) => report.restored += 1,
                Err(err) => {
                    warn!(
                        collection = %name,
                        id = %record.id,
                        error = %err,
                        "document restore failed"
                    );
                    report.failures.push(DocumentFailure {
                        collection: name.clone(),
                        id: record.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        debug!(collection = %name, records = records.len(), "collection restored");
    }

    if report.cancelled {
        warn!(restored = report.restored, "restore cancelled; written documents are kept");
    } else {
        info!(
            restored = report.restored,
            collections = report.collections_touched,
            failures = report.failures.len(),
            "restore finished"
        );
    }
    Ok(report)
}
