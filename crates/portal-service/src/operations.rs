//! Operator actions behind the admin backup screen.

use anyhow::{Context, Result};
use chrono::Utc;
use portal_core::backup::{
    self, BackupMetadata, ExportSummary, RestoreOptions, RestoreProgress, RestoreReport,
    BACKUP_FORMAT_VERSION,
};
use portal_core::config::PortalConfig;
use portal_core::event_log::{
    EventLog, EventSeverity, BACKUP_EXPORTED, RESTORE_COMPLETED, RESTORE_REJECTED,
};
use portal_core::store::DocumentStore;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub summary: ExportSummary,
}

/// Export every backed-up collection into a dated file under `out_dir`, or
/// the configured backup directory when none is given.
pub async fn download_backup(
    store: &dyn DocumentStore,
    config: &PortalConfig,
    out_dir: Option<&Path>,
    events: Option<&EventLog>,
) -> Result<DownloadOutcome> {
    let metadata = BackupMetadata {
        exported_at: Some(Utc::now()),
        exported_by: config.operator.clone(),
        product: config.product_name.clone(),
        client_id: config.client_id.clone(),
        format_version: BACKUP_FORMAT_VERSION,
    };
    let exported = backup::export(store, metadata)
        .await
        .context("backup export failed")?;

    let dir = out_dir.unwrap_or(&config.backup_dir);
    let path = backup::write_backup_file(dir, &exported.manifest, Utc::now().date_naive())
        .with_context(|| format!("write backup into {}", dir.display()))?;
    info!(
        path = %path.display(),
        total = exported.summary.total,
        "backup written"
    );

    if let Some(events) = events {
        events.append(
            BACKUP_EXPORTED,
            EventSeverity::Info,
            serde_json::json!({
                "path": path.display().to_string(),
                "operator": config.operator,
                "total": exported.summary.total,
                "counts": exported.summary.counts,
                "skippedCollections": exported.summary.skipped_collections,
            }),
        )?;
    }

    Ok(DownloadOutcome {
        path,
        summary: exported.summary,
    })
}

/// Replay one backup file into `store`. A rejected file is an error and has
/// written nothing; per-document failures come back inside the report.
pub async fn upload_and_restore(
    store: &dyn DocumentStore,
    file: &Path,
    options: &RestoreOptions,
    cancel: Option<watch::Receiver<bool>>,
    events: Option<&EventLog>,
) -> Result<RestoreReport> {
    let json = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("read backup file {}", file.display()))?;

    let on_progress = |progress: RestoreProgress<'_>| {
        info!(
            collection = progress.collection,
            step = progress.index + 1,
            of = progress.collections,
            records = progress.records,
            "restoring collection"
        );
    };

    let report = match backup::restore(store, &json, options, cancel, Some(&on_progress)).await {
        Ok(report) => report,
        Err(err) => {
            error!(file = %file.display(), error = %err, "backup file rejected");
            if let Some(events) = events {
                events.append(
                    RESTORE_REJECTED,
                    EventSeverity::Error,
                    serde_json::json!({
                        "file": file.display().to_string(),
                        "error": err.to_string(),
                    }),
                )?;
            }
            return Err(anyhow::Error::new(err)
                .context(format!("restore of {} rejected", file.display())));
        }
    };

    if !report.is_complete() {
        warn!(
            restored = report.restored,
            failures = report.failures.len(),
            cancelled = report.cancelled,
            "restore incomplete; written documents were not rolled back"
        );
    }
    if let Some(events) = events {
        let severity = if report.is_complete() {
            EventSeverity::Info
        } else {
            EventSeverity::Warn
        };
        events.append(
            RESTORE_COMPLETED,
            severity,
            serde_json::json!({
                "file": file.display().to_string(),
                "report": report,
            }),
        )?;
    }
    Ok(report)
}

/// Human-readable summary of a restore run.
pub fn restore_summary(report: &RestoreReport) -> String {
    let mut out = format!(
        "restored {} documents across {} collections",
        report.restored, report.collections_touched
    );
    if report.cancelled {
        out.push_str("\ncancelled before the end of the file");
    }
    if !report.failures.is_empty() {
        out.push_str(&format!("\n{} documents failed:", report.failures.len()));
        for failure in &report.failures {
            out.push_str(&format!(
                "\n  {}/{}: {}",
                failure.collection, failure.id, failure.error
            ));
        }
    }
    if !report.is_complete() {
        out.push_str(
            "\nwarning: restore is not transactional; documents written before the \
             failure were kept and nothing was rolled back. Fix the cause and run the \
             same file again.",
        );
    }
    out
}
