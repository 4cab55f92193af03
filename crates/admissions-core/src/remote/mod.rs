//! Secure remote channel used by sync sessions.
//!
//! [`RemoteFs`] is the minimal set of file primitives the store needs from the
//! remote side. Atomicity is pushed down to it: `rename` must replace the
//! target in one step and `create_exclusive` must fail when the path exists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::SyncResult;

mod dir;
mod ssh;

pub use dir::DirRemote;
pub use ssh::{shell_quote, SshRemote};

#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Human-readable endpoint, used in logs.
    fn describe(&self) -> String;

    async fn connect(&self) -> SyncResult<()>;

    async fn close(&self) -> SyncResult<()>;

    async fn exists(&self, path: &str) -> SyncResult<bool>;

    /// Copy `remote` into `local`. Fails with `RemoteMissing` if absent.
    async fn download(&self, remote: &str, local: &Path) -> SyncResult<()>;

    /// Write `local` to `remote`, replacing it. Not atomic; callers stage.
    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<()>;

    /// Atomically move `from` over `to`. `Ok(false)` when `from` is missing.
    async fn rename(&self, from: &str, to: &str) -> SyncResult<bool>;

    /// Remove `path`; a missing path is not an error.
    async fn remove(&self, path: &str) -> SyncResult<()>;

    /// Create `path` with `contents` only if it does not exist yet.
    async fn create_exclusive(&self, path: &str, contents: &[u8]) -> SyncResult<bool>;

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>>;

    async fn modified(&self, path: &str) -> SyncResult<Option<DateTime<Utc>>>;

    /// Hex SHA-256 of the remote file, if it exists.
    async fn checksum(&self, path: &str) -> SyncResult<Option<String>>;
}
