mod common;

use admissions_core::clock::{Clock, ManualClock};
use admissions_core::error::{SyncError, SyncResult};
use admissions_core::lock::{LockManager, LockToken};
use admissions_core::remote::{DirRemote, RemoteFs};
use admissions_core::retry::RetryPolicy;
use admissions_core::session::SyncSession;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::*;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const LOCK: &str = "/srv/escuela/escuela.db.lock";

fn patient_settings(holder: &str, local: &Path, lock_attempts: u32) -> admissions_core::SyncSettings {
    let mut s = settings(holder, local);
    s.lock.ttl_secs = 1;
    s.retry.transient = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 400,
        max_backoff_ms: 1_000,
        multiplier: 2,
    };
    s.retry.lock_attempts = lock_attempts;
    s
}

#[tokio::test(start_paused = true)]
async fn lock_retry_waits_out_a_short_lived_holder() {
    let remote_dir = tempdir().unwrap();
    let local = remote_dir.path().join("local.db");
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let remote: Arc<dyn RemoteFs> = Arc::new(DirRemote::new(remote_dir.path()));

    let mut a = SyncSession::open(patient_settings("A", &local, 1), remote.clone(), clock.clone())
        .await
        .unwrap();
    let mut b = SyncSession::open(patient_settings("B", &local, 4), remote, clock)
        .await
        .unwrap();

    a.acquire_lock().await.unwrap();
    // backoff 400ms then 800ms: the third attempt lands after A's 1s expiry
    let token = b.acquire_lock_with_retry().await.unwrap();
    assert_eq!(token.holder, "B");
    assert_eq!(b.locks().current().await.unwrap(), Some(token));

    b.close().await.unwrap();
    a.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lock_retry_gives_up_after_configured_attempts() {
    let remote_dir = tempdir().unwrap();
    let local = remote_dir.path().join("local.db");
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let remote: Arc<dyn RemoteFs> = Arc::new(DirRemote::new(remote_dir.path()));

    let mut a = SyncSession::open(patient_settings("A", &local, 1), remote.clone(), clock.clone())
        .await
        .unwrap();
    let mut b = SyncSession::open(patient_settings("B", &local, 2), remote, clock)
        .await
        .unwrap();

    let held = a.acquire_lock().await.unwrap();
    let started = tokio::time::Instant::now();
    let err = b.acquire_lock_with_retry().await.unwrap_err();
    assert!(matches!(err, SyncError::LockContention { ref holder, .. } if holder == "A"));
    // one backoff between the two attempts, no more
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(400) && waited < Duration::from_millis(800));
    assert!(b.held_lock().is_none());
    assert_eq!(a.locks().current().await.unwrap(), Some(held));

    b.close().await.unwrap();
    a.close().await.unwrap();
}

/// Moves a fresh foreign token into the lock path just before the next
/// rename of the lock file, as if another claimant evicted the stale token
/// and claimed the lock first.
struct RacingRemote {
    inner: DirRemote,
    claim_on_rename: Mutex<Option<Vec<u8>>>,
}

#[async_trait]
impl RemoteFs for RacingRemote {
    fn describe(&self) -> String {
        self.inner.describe()
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
        self.inner.download(remote, local).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<()> {
        self.inner.upload(local, remote).await
    }

    async fn rename(&self, from: &str, to: &str) -> SyncResult<bool> {
        let claim = if from == LOCK {
            self.claim_on_rename.lock().take()
        } else {
            None
        };
        if let Some(bytes) = claim {
            self.inner.remove(LOCK).await?;
            assert!(self.inner.create_exclusive(LOCK, &bytes).await?);
        }
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

#[tokio::test]
async fn displaced_live_token_is_restored() {
    let dir = tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let racing = Arc::new(RacingRemote {
        inner: DirRemote::new(dir.path()),
        claim_on_rename: Mutex::new(None),
    });
    let remote: Arc<dyn RemoteFs> = racing.clone();
    let locks = LockManager::new(remote, clock.clone(), LOCK);

    locks.acquire("A", Duration::from_secs(5)).await.unwrap();
    clock.advance(chrono::Duration::seconds(10));

    let winner = LockToken::new("B", clock.now(), Duration::from_secs(5));
    *racing.claim_on_rename.lock() = Some(serde_json::to_vec_pretty(&winner).unwrap());

    let err = locks.acquire("C", Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, SyncError::LockContention { ref holder, .. } if holder == "B"));
    assert_eq!(locks.current().await.unwrap(), Some(winner));
    assert!(files_containing(&dir.path().join("srv/escuela"), ".evicted-").is_empty());
}
