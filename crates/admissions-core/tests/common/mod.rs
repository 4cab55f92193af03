#![allow(dead_code)]

use admissions_core::clock::Clock;
use admissions_core::error::{SyncError, SyncResult};
use admissions_core::remote::{DirRemote, RemoteFs};
use admissions_core::retry::RetryPolicy;
use admissions_core::settings::SyncSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

pub const REMOTE_DB: &str = "/srv/escuela/escuela.db";

pub fn settings(holder: &str, local: &Path) -> SyncSettings {
    let mut s = SyncSettings::default();
    s.remote.host = "localhost".into();
    s.remote.db_path = REMOTE_DB.into();
    s.local_db_path = local.to_path_buf();
    s.holder = holder.into();
    s.lock.ttl_secs = 5;
    s.retry.transient = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2,
    };
    s.retry.lock_attempts = 1;
    s
}

pub fn set_mtime(path: &Path, at: SystemTime) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(at).unwrap();
}

pub fn secs_ago(secs: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(secs)
}

pub fn files_containing(dir: &Path, needle: &str) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().contains(needle))
            .collect(),
        Err(_) => vec![],
    }
}

/// Wall clock driven by tokio's test clock, so paused-time sleeps move it.
pub struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

/// A [`DirRemote`] that fails a configurable number of calls per operation.
pub struct FlakyRemote {
    pub inner: DirRemote,
    pub failing_uploads: AtomicU32,
    pub failing_downloads: AtomicU32,
    pub failing_renames: AtomicU32,
    pub uploads: AtomicU32,
}

impl FlakyRemote {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: DirRemote::new(root),
            failing_uploads: AtomicU32::new(0),
            failing_downloads: AtomicU32::new(0),
            failing_renames: AtomicU32::new(0),
            uploads: AtomicU32::new(0),
        }
    }

    fn trip(counter: &AtomicU32, op: &'static str) -> SyncResult<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(SyncError::Transfer {
                op,
                reason: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteFs for FlakyRemote {
    fn describe(&self) -> String {
        format!("flaky:{}", self.inner.describe())
    }

    async fn connect(&self) -> SyncResult<()> {
        self.inner.connect().await
    }

    async fn close(&self) -> SyncResult<()> {
        self.inner.close().await
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        self.inner.exists(path).await
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<()> {
        Self::trip(&self.failing_downloads, "download")?;
        self.inner.download(remote, local).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Self::trip(&self.failing_uploads, "upload")?;
        self.inner.upload(local, remote).await
    }

    async fn rename(&self, from: &str, to: &str) -> SyncResult<bool> {
        Self::trip(&self.failing_renames, "rename")?;
        self.inner.rename(from, to).await
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        self.inner.remove(path).await
    }

    async fn create_exclusive(&self, path: &str, contents: &[u8]) -> SyncResult<bool> {
        self.inner.create_exclusive(path, contents).await
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        self.inner.read(path).await
    }

    async fn modified(&self, path: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.inner.modified(path).await
    }

    async fn checksum(&self, path: &str) -> SyncResult<Option<String>> {
        self.inner.checksum(path).await
    }
}
