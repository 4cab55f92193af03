//! Session-scoped access to the shared database file.
//!
//! A [`SyncSession`] is created for one page load, CLI invocation or
//! migration run and carries everything that used to live in process-wide
//! state: the remote channel, the lock token it holds, and the last remote
//! checksum it saw. Call [`SyncSession::close`] when done; a session dropped
//! without closing leaves its lock to expire on its own.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::digest::{sha256_file, sha256_file_opt};
use crate::error::{SyncError, SyncResult};
use crate::journal::{Notifier, SyncEvent, TracingNotifier};
use crate::lock::{LockManager, LockToken};
use crate::remote::RemoteFs;
use crate::retry::{retry, retry_transient, RetryPolicy};
use crate::settings::SyncSettings;

pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = SyncResult<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Both sides already hold the same bytes.
    InSync { checksum: String },
    /// The remote copy was newer (or the only one) and replaced the local file.
    PulledRemote { checksum: String },
    /// The local copy was newer and replaced the remote file.
    PushedLocal { checksum: String },
    /// First run: no remote copy existed, the local file was pushed.
    InitializedRemote { checksum: String },
    /// Neither side has a database yet.
    NothingToSync,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::InSync { .. } => "in sync",
            ReconcileOutcome::PulledRemote { .. } => "pulled remote",
            ReconcileOutcome::PushedLocal { .. } => "pushed local",
            ReconcileOutcome::InitializedRemote { .. } => "initialized remote",
            ReconcileOutcome::NothingToSync => "nothing to sync",
        }
    }

    pub fn checksum(&self) -> Option<&str> {
        match self {
            ReconcileOutcome::InSync { checksum }
            | ReconcileOutcome::PulledRemote { checksum }
            | ReconcileOutcome::PushedLocal { checksum }
            | ReconcileOutcome::InitializedRemote { checksum } => Some(checksum),
            ReconcileOutcome::NothingToSync => None,
        }
    }
}

pub struct SyncSession {
    remote: Arc<dyn RemoteFs>,
    locks: LockManager,
    settings: SyncSettings,
    notifier: Arc<dyn Notifier>,
    held: Option<LockToken>,
    last_remote_checksum: Option<String>,
    open: bool,
}

impl SyncSession {
    /// Connect to the remote and start a session.
    pub async fn open(
        settings: SyncSettings,
        remote: Arc<dyn RemoteFs>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        retry_transient(&settings.retry.transient, "connect", || remote.connect()).await?;
        debug!(remote = %remote.describe(), holder = %settings.holder, "sync session opened");
        let locks = LockManager::new(remote.clone(), clock, settings.lock_path());
        Ok(Self {
            remote,
            locks,
            settings,
            notifier: Arc::new(TracingNotifier),
            held: None,
            last_remote_checksum: None,
            open: true,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn holder(&self) -> &str {
        &self.settings.holder
    }

    pub fn remote_path(&self) -> &str {
        &self.settings.remote.db_path
    }

    pub fn held_lock(&self) -> Option<&LockToken> {
        self.held.as_ref()
    }

    pub fn last_remote_checksum(&self) -> Option<&str> {
        self.last_remote_checksum.as_deref()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn policy(&self) -> &RetryPolicy {
        &self.settings.retry.transient
    }

    fn report<T>(&self, op: &str, result: &SyncResult<T>, detail: impl FnOnce(&T) -> String) {
        self.report_with(op, result, |value| (detail(value), None));
    }

    /// Like `report`, but the event also carries the database checksum.
    fn report_with<T>(
        &self,
        op: &str,
        result: &SyncResult<T>,
        describe: impl FnOnce(&T) -> (String, Option<String>),
    ) {
        let event = match result {
            Ok(value) => {
                let (detail, checksum) = describe(value);
                SyncEvent::success(op, self.holder(), detail).with_checksum(checksum)
            }
            Err(e) => SyncEvent::failure(op, self.holder(), e.to_string()),
        };
        self.notifier.notify(&event);
    }

    /// One attempt at the write lock using the configured TTL.
    pub async fn acquire_lock(&mut self) -> SyncResult<LockToken> {
        let result = self.claim(&RetryPolicy::no_retry()).await;
        self.report("acquire_lock", &result, |t| format!("expires {}", t.expires_at));
        let token = result?;
        self.held = Some(token.clone());
        Ok(token)
    }

    /// Like [`acquire_lock`](Self::acquire_lock) but retries contention up to
    /// `retry.lock_attempts` times with backoff before surfacing it.
    pub async fn acquire_lock_with_retry(&mut self) -> SyncResult<LockToken> {
        let policy = self
            .policy()
            .clone()
            .with_attempts(self.settings.retry.lock_attempts);
        let result = self.claim(&policy).await;
        self.report("acquire_lock", &result, |t| format!("expires {}", t.expires_at));
        let token = result?;
        self.held = Some(token.clone());
        Ok(token)
    }

    async fn claim(&self, contention_policy: &RetryPolicy) -> SyncResult<LockToken> {
        let holder = self.holder();
        let ttl = self.settings.lock_ttl();
        let transient = self.policy();
        let locks = &self.locks;
        retry(
            contention_policy,
            "acquire_lock",
            SyncError::is_lock_contention,
            move || retry_transient(transient, "acquire_lock", move || locks.acquire(holder, ttl)),
        )
        .await
    }

    /// Give up the write lock, if held.
    pub async fn release_lock(&mut self) -> SyncResult<()> {
        let Some(token) = self.held.take() else {
            return Ok(());
        };
        let locks = &self.locks;
        let held = &token;
        let result =
            retry_transient(self.policy(), "release_lock", move || locks.release(held)).await;
        self.report("release_lock", &result, |_| format!("token {}", token.token_id));
        result
    }

    /// Download the remote database over `local_path`.
    ///
    /// The download lands in a temporary file beside `local_path` and is
    /// renamed into place only once complete; on any failure, including
    /// `RemoteMissing`, the local file is untouched.
    pub async fn fetch_remote(&mut self, local_path: &Path) -> SyncResult<String> {
        let result = self.fetch_inner(local_path).await;
        self.report_with("fetch_remote", &result, |sum| {
            (format!("{} bytes", file_len(local_path)), Some(sum.clone()))
        });
        let checksum = result?;
        self.last_remote_checksum = Some(checksum.clone());
        info!(path = %local_path.display(), checksum = %checksum, "fetched remote database");
        Ok(checksum)
    }

    async fn fetch_inner(&self, local_path: &Path) -> SyncResult<String> {
        let dir = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| SyncError::io("fetch_remote", e))?;
        let staged = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| SyncError::io("fetch_remote", e))?;
        let remote_path = self.remote_path();
        let remote = &self.remote;
        let staged_path = staged.path();
        retry_transient(self.policy(), "fetch_remote", move || {
            remote.download(remote_path, staged_path)
        })
        .await?;
        let checksum = sha256_file(staged.path()).map_err(|e| SyncError::io("fetch_remote", e))?;
        staged
            .persist(local_path)
            .map_err(|e| SyncError::io("fetch_remote", e.error))?;
        Ok(checksum)
    }

    /// Publish `local_path` as the new remote database. Requires the lock.
    ///
    /// Uploads to a unique temporary remote path, checks its digest, then
    /// renames it over the live file so readers never see a partial copy.
    pub async fn push_local(&mut self, local_path: &Path) -> SyncResult<String> {
        if self.held.is_some() {
            match self.remote_changed().await {
                Ok(true) => warn!(
                    remote = %self.remote_path(),
                    "remote copy changed since this session last saw it; replacing it"
                ),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "cannot compare remote checksum before push"),
            }
        }
        let result = self.push_inner(local_path).await;
        self.report_with("push_local", &result, |sum| {
            (format!("{} bytes", file_len(local_path)), Some(sum.clone()))
        });
        let checksum = result?;
        self.last_remote_checksum = Some(checksum.clone());
        info!(path = %local_path.display(), checksum = %checksum, "pushed local database");
        Ok(checksum)
    }

    /// Whether the remote file differs from the copy this session last
    /// fetched or pushed. `false` until the session has seen the remote.
    pub async fn remote_changed(&self) -> SyncResult<bool> {
        let Some(seen) = self.last_remote_checksum.as_deref() else {
            return Ok(false);
        };
        let remote = &self.remote;
        let remote_path = self.remote_path();
        let current =
            retry_transient(self.policy(), "remote_changed", move || remote.checksum(remote_path))
                .await?;
        Ok(current.as_deref() != Some(seen))
    }

    async fn push_inner(&self, local_path: &Path) -> SyncResult<String> {
        let token = self
            .held
            .as_ref()
            .ok_or(SyncError::LockLost { op: "push_local" })?;
        self.verify_lock(token).await?;
        let checksum = sha256_file(local_path).map_err(|e| SyncError::io("push_local", e))?;

        let remote_path = self.remote_path();
        let staged = format!("{}.tmp-{}", remote_path, Uuid::new_v4().simple());
        let result = self.stage_and_swap(local_path, &staged, &checksum, token).await;
        if result.is_err() {
            if let Err(e) = self.remote.remove(&staged).await {
                warn!(error = %e, staged = %staged, "cannot remove staged upload");
            }
        }
        result.map(|_| checksum)
    }

    async fn stage_and_swap(
        &self,
        local_path: &Path,
        staged: &str,
        checksum: &str,
        token: &LockToken,
    ) -> SyncResult<()> {
        let remote = &self.remote;
        let remote_path = self.remote_path();
        retry_transient(self.policy(), "push_local", move || remote.upload(local_path, staged))
            .await?;

        let uploaded =
            retry_transient(self.policy(), "push_local", move || remote.checksum(staged)).await?;
        if uploaded.as_deref() != Some(checksum) {
            return Err(SyncError::Transfer {
                op: "push_local",
                reason: format!("staged copy digest {uploaded:?} does not match {checksum}"),
            });
        }

        self.verify_lock(token).await?;
        let renamed =
            retry_transient(self.policy(), "push_local", move || remote.rename(staged, remote_path))
                .await?;
        if !renamed {
            // a retried rename whose first attempt already landed
            let live = retry_transient(self.policy(), "push_local", move || remote.checksum(remote_path))
                .await?;
            if live.as_deref() != Some(checksum) {
                return Err(SyncError::Transfer {
                    op: "push_local",
                    reason: "staged upload disappeared before rename".into(),
                });
            }
        }
        Ok(())
    }

    async fn verify_lock(&self, token: &LockToken) -> SyncResult<()> {
        let locks = &self.locks;
        retry_transient(self.policy(), "verify_lock", move || {
            locks.verify_held(token, "push_local")
        })
        .await
    }

    /// Make local and remote agree, last writer wins.
    ///
    /// Equal checksums are a no-op. Otherwise the side with the later
    /// modification time (whole seconds) overwrites the other; a tie goes to
    /// the remote copy. No merge is attempted.
    pub async fn reconcile(&mut self, local_path: &Path) -> SyncResult<ReconcileOutcome> {
        let result = self.reconcile_inner(local_path).await;
        self.report_with("reconcile", &result, |o| {
            (o.label().to_string(), o.checksum().map(str::to_string))
        });
        result
    }

    async fn reconcile_inner(&mut self, local_path: &Path) -> SyncResult<ReconcileOutcome> {
        let local_sum = sha256_file_opt(local_path).map_err(|e| SyncError::io("reconcile", e))?;
        let remote_handle = self.remote.clone();
        let remote_path_owned = self.remote_path().to_string();
        let remote = &remote_handle;
        let remote_path = remote_path_owned.as_str();
        let remote_sum =
            retry_transient(self.policy(), "reconcile", move || remote.checksum(remote_path))
                .await?;

        match (local_sum, remote_sum) {
            (None, None) => Ok(ReconcileOutcome::NothingToSync),
            (Some(l), Some(r)) if l == r => {
                debug!(checksum = %r, "local and remote agree");
                self.last_remote_checksum = Some(r.clone());
                Ok(ReconcileOutcome::InSync { checksum: r })
            }
            (None, Some(_)) => {
                let checksum = self.fetch_remote(local_path).await?;
                Ok(ReconcileOutcome::PulledRemote { checksum })
            }
            (Some(_), None) => {
                let checksum = self.push_holding_lock(local_path).await?;
                Ok(ReconcileOutcome::InitializedRemote { checksum })
            }
            (Some(_), Some(_)) => {
                let local_mtime = local_modified(local_path)?;
                let remote_mtime =
                    retry_transient(self.policy(), "reconcile", move || remote.modified(remote_path))
                        .await?;
                let local_wins = match remote_mtime {
                    Some(remote_mtime) => local_mtime.timestamp() > remote_mtime.timestamp(),
                    None => true,
                };
                info!(
                    local = %local_mtime,
                    remote = ?remote_mtime,
                    winner = if local_wins { "local" } else { "remote" },
                    "copies diverged; last writer wins"
                );
                if local_wins {
                    let checksum = self.push_holding_lock(local_path).await?;
                    Ok(ReconcileOutcome::PushedLocal { checksum })
                } else {
                    let checksum = self.fetch_remote(local_path).await?;
                    Ok(ReconcileOutcome::PulledRemote { checksum })
                }
            }
        }
    }

    async fn push_holding_lock(&mut self, local_path: &Path) -> SyncResult<String> {
        if self.held.is_some() {
            return self.push_local(local_path).await;
        }
        self.acquire_lock_with_retry().await?;
        let result = self.push_local(local_path).await;
        if let Err(e) = self.release_lock().await {
            warn!(error = %e, "lock release failed; it will expire on its own");
        }
        result
    }

    /// Run `f` while holding the write lock; the lock is released on every
    /// exit path, including errors from `f`.
    pub async fn with_write_lock<T, F>(&mut self, f: F) -> SyncResult<T>
    where
        F: for<'a> FnOnce(&'a mut SyncSession) -> SessionFuture<'a, T>,
    {
        self.acquire_lock_with_retry().await?;
        let result = f(self).await;
        let released = self.release_lock().await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!(error = %release_err, "lock release failed after error");
                Err(e)
            }
        }
    }

    /// Release any held lock and close the remote channel.
    pub async fn close(mut self) -> SyncResult<()> {
        let released = self.release_lock().await;
        let closed = self.remote.close().await;
        self.open = false;
        debug!(holder = %self.holder(), "sync session closed");
        released.and(closed)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if self.open {
            if let Some(token) = &self.held {
                warn!(
                    holder = %token.holder,
                    expires_at = %token.expires_at,
                    "session dropped while holding lock; it will expire"
                );
            }
        }
    }
}

fn local_modified(path: &Path) -> SyncResult<DateTime<Utc>> {
    let meta = std::fs::metadata(path).map_err(|e| SyncError::io("reconcile", e))?;
    let mtime = meta.modified().map_err(|e| SyncError::io("reconcile", e))?;
    Ok(DateTime::<Utc>::from(mtime))
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
