//! Hash-chained audit journal of sync activity, plus the notification seam.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
}

/// Something a session did that the office should hear about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncEvent {
    pub operation: String,
    pub outcome: Outcome,
    pub holder: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl SyncEvent {
    pub fn success(operation: &str, holder: &str, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            outcome: Outcome::Success,
            holder: holder.to_string(),
            detail: detail.into(),
            checksum: None,
        }
    }

    pub fn failure(operation: &str, holder: &str, detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            ..Self::success(operation, holder, detail)
        }
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }
}

/// Outbound notification channel for key operations.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &SyncEvent);
}

/// Reports events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &SyncEvent) {
        match event.outcome {
            Outcome::Success => info!(
                operation = %event.operation,
                holder = %event.holder,
                detail = %event.detail,
                "sync event"
            ),
            Outcome::Failure => error!(
                operation = %event.operation,
                holder = %event.holder,
                detail = %event.detail,
                "sync failure"
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SyncEvent,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

pub struct Journal {
    path: PathBuf,
    inner: Mutex<ChainState>,
    max_bytes: u64,
}

impl Journal {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        if let Some(last) = Self::read_entries(path)?.pop() {
            return Ok((last.seq, last.hash));
        }
        // a fresh file after rotation starts a new chain but keeps counting
        let last_seq = Self::read_entries(&rotated_path(path, 1)?)?
            .last()
            .map_or(0, |entry| entry.seq);
        Ok((last_seq, CHAIN_START.to_string()))
    }

    fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn compute_hash(
        seq: u64,
        timestamp: &DateTime<Utc>,
        event: &SyncEvent,
        prev_hash: &str,
    ) -> Result<String> {
        let body = serde_json::json!({
            "seq": seq,
            "timestamp": timestamp,
            "event": event,
            "prev_hash": prev_hash,
        });
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn append(&self, event: SyncEvent) -> Result<JournalEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let timestamp = Utc::now();
        let prev_hash = state.last_hash.clone();
        let hash = Self::compute_hash(seq, &timestamp, &event, &prev_hash)?;
        let entry = JournalEntry {
            seq,
            timestamp,
            event,
            prev_hash,
            hash: hash.clone(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
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
        // each file is its own chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Most recent entries of the current file, newest first.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<JournalEntry>> {
        let mut entries = Self::read_entries(&self.path)?;
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Walk the current file and check every link and hash.
    pub fn verify_chain(&self) -> Result<()> {
        let mut prev = CHAIN_START.to_string();
        for entry in Self::read_entries(&self.path)? {
            if entry.prev_hash != prev {
                return Err(anyhow!("journal chain broken at seq {}", entry.seq));
            }
            let expected =
                Self::compute_hash(entry.seq, &entry.timestamp, &entry.event, &entry.prev_hash)?;
            if expected != entry.hash {
                return Err(anyhow!("journal entry {} was modified", entry.seq));
            }
            prev = entry.hash;
        }
        Ok(())
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        rotated_path(&self.path, index)
    }
}

fn rotated_path(path: &Path, index: usize) -> Result<PathBuf> {
    let filename = path
        .file_name()
        .ok_or_else(|| anyhow!("journal path has no file name"))?
        .to_string_lossy()
        .to_string();
    Ok(path.with_file_name(format!("{filename}.{index}")))
}

impl Notifier for Journal {
    fn notify(&self, event: &SyncEvent) {
        if let Err(e) = self.append(event.clone()) {
            warn!(error = %e, operation = %event.operation, "cannot append to sync journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_links_and_rotates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync-journal.log");
        let journal = Journal::open(&path, 512).unwrap();
        for i in 0..40u64 {
            let entry = journal
                .append(SyncEvent::success("push_local", "staff1", format!("run {i}")))
                .unwrap();
            assert_eq!(entry.seq, i + 1);
        }
        assert!(path.with_file_name("sync-journal.log.1").exists());
        journal.verify_chain().unwrap();
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.log");
        {
            let journal = Journal::open(&path, 1 << 20).unwrap();
            journal
                .append(SyncEvent::failure("fetch_remote", "staff1", "timed out"))
                .unwrap();
        }
        let journal = Journal::open(&path, 1 << 20).unwrap();
        let entry = journal
            .append(SyncEvent::success("fetch_remote", "staff1", "ok"))
            .unwrap();
        assert_eq!(entry.seq, 2);
        let recent = journal.read_recent(Some(1)).unwrap();
        assert_eq!(recent[0].event.detail, "ok");
        journal.verify_chain().unwrap();
    }

    #[test]
    fn sequence_survives_restart_after_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.log");
        {
            let journal = Journal::open(&path, 1 << 20).unwrap();
            for _ in 0..3 {
                journal
                    .append(SyncEvent::success("push_local", "staff1", "ok"))
                    .unwrap();
            }
        }
        // stopped between rotating the file away and writing the next entry
        std::fs::rename(&path, dir.path().join("j.log.1")).unwrap();

        let journal = Journal::open(&path, 1 << 20).unwrap();
        let entry = journal
            .append(SyncEvent::success("fetch_remote", "staff1", "ok"))
            .unwrap();
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.prev_hash, CHAIN_START);
        journal.verify_chain().unwrap();
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j.log");
        let journal = Journal::open(&path, 1 << 20).unwrap();
        journal
            .append(SyncEvent::success("reconcile", "migracion", "in sync"))
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("in sync", "pushed")).unwrap();
        assert!(journal.verify_chain().is_err());
    }
}
