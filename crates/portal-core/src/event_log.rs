use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

pub const GUARD_BLOCKED: &str = "GUARD_BLOCKED";
pub const GUARD_UNBLOCKED: &str = "GUARD_UNBLOCKED";
pub const POLICY_UNAVAILABLE: &str = "POLICY_UNAVAILABLE";
pub const BACKUP_EXPORTED: &str = "BACKUP_EXPORTED";
pub const RESTORE_COMPLETED: &str = "RESTORE_COMPLETED";
pub const RESTORE_REJECTED: &str = "RESTORE_REJECTED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Append-only audit trail of guard transitions and operator actions.
/// Each line carries the hash of the previous one.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogAnchor {
    pub date: String,
    pub hash: String,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

impl EventLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventEntry = serde_json::from_str(&line)?;
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(entry_without_hash.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn append(
        &self,
        event_type: &str,
        severity: EventSeverity,
        data: serde_json::Value,
    ) -> Result<EventEntry> {
        self.rotate_if_needed()?;
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let prev_hash = state.last_hash.clone();
        let mut entry_value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event_type,
            "severity": severity,
            "data": data,
            "prev_hash": prev_hash,
        });
        let hash = Self::compute_hash(&entry_value);
        entry_value["hash"] = serde_json::Value::String(hash.clone());

        let entry: EventEntry = serde_json::from_value(entry_value)?;
        self.write_entry(&entry)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &EventEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let mut state = self.inner.lock();
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i)?;
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1)?)?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1)?)?;
        // new file, new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Hash the current log file into a dated anchor written to `anchor_path`.
    pub fn anchor_daily<P: AsRef<Path>>(&self, anchor_path: P) -> Result<LogAnchor> {
        let date = Utc::now().date_naive().to_string();
        let mut hasher = Sha256::new();
        if self.path.exists() {
            let file = File::open(&self.path)?;
            let mut reader = BufReader::new(file);
            let mut buf = String::new();
            while reader.read_line(&mut buf)? != 0 {
                hasher.update(buf.as_bytes());
                buf.clear();
            }
        }
        let hash = hex::encode(hasher.finalize());
        let anchor = LogAnchor { date, hash };
        let anchor_json = serde_json::to_string_pretty(&anchor)?;
        fs::write(anchor_path, anchor_json)?;
        Ok(anchor)
    }

    /// Most recent events first, optionally since a timestamp and capped.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<EventEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: EventEntry = serde_json::from_str(&line)?;
            if let Some(since_ts) = &since {
                if entry.timestamp < *since_ts {
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Check that every entry in the live file links to its predecessor.
    pub fn verify_chain(&self) -> Result<usize> {
        let mut entries = self.read_recent(None, None)?;
        entries.reverse();
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            if entry.prev_hash != prev {
                return Err(anyhow!("chain broken at seq {}", entry.seq));
            }
            let recomputed = Self::compute_hash(&serde_json::json!({
                "seq": entry.seq,
                "timestamp": entry.timestamp,
                "event_type": entry.event_type,
                "severity": entry.severity,
                "data": entry.data,
                "prev_hash": entry.prev_hash,
            }));
            if recomputed != entry.hash {
                return Err(anyhow!("hash mismatch at seq {}", entry.seq));
            }
            prev = entry.hash.clone();
        }
        Ok(entries.len())
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        let filename = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("event log path has no file name"))?
            .to_string_lossy()
            .to_string();
        Ok(self.path.with_file_name(format!("{}.{}", filename, index)))
    }
}
