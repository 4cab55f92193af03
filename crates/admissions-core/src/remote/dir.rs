use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::RemoteFs;
use crate::digest::sha256_file_opt;
use crate::error::{SyncError, SyncResult};

/// A directory standing in for the remote host, e.g. a mounted share.
///
/// Remote paths are resolved below `root`; a leading `/` is ignored.
#[derive(Debug, Clone)]
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn ensure_parent(&self, op: &'static str, path: &Path) -> SyncResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer(op, e))?;
        }
        Ok(())
    }
}

fn transfer(op: &'static str, e: std::io::Error) -> SyncError {
    SyncError::Transfer {
        op,
        reason: e.to_string(),
    }
}

#[async_trait]
impl RemoteFs for DirRemote {
    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn connect(&self) -> SyncResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SyncError::Connection {
                op: "connect",
                reason: format!("{} is not a directory", self.root.display()),
            }),
            Err(e) => Err(SyncError::Connection {
                op: "connect",
                reason: e.to_string(),
            }),
        }
    }

    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| transfer("exists", e))
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<()> {
        let src = self.resolve(remote);
        match tokio::fs::copy(&src, local).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound && !src.exists() => {
                Err(SyncError::RemoteMissing {
                    path: remote.to_string(),
                })
            }
            Err(e) => Err(transfer("download", e)),
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<()> {
        let dest = self.resolve(remote);
        self.ensure_parent("upload", &dest).await?;
        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| transfer("upload", e))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> SyncResult<bool> {
        let dest = self.resolve(to);
        self.ensure_parent("rename", &dest).await?;
        match tokio::fs::rename(self.resolve(from), dest).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(transfer("rename", e)),
        }
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transfer("remove", e)),
        }
    }

    async fn create_exclusive(&self, path: &str, contents: &[u8]) -> SyncResult<bool> {
        let dest = self.resolve(path);
        self.ensure_parent("create_exclusive", &dest).await?;
        let mut scratch = dest.clone().into_os_string();
        scratch.push(format!(".claim-{}", Uuid::new_v4().simple()));
        let scratch = PathBuf::from(scratch);
        let mut file = tokio::fs::File::create(&scratch)
            .await
            .map_err(|e| transfer("create_exclusive", e))?;
        file.write_all(contents)
            .await
            .map_err(|e| transfer("create_exclusive", e))?;
        file.sync_all()
            .await
            .map_err(|e| transfer("create_exclusive", e))?;
        drop(file);
        // hard_link refuses to replace, so the token appears whole or not at all
        let linked = tokio::fs::hard_link(&scratch, &dest).await;
        let _ = tokio::fs::remove_file(&scratch).await;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(transfer("create_exclusive", e)),
        }
        Ok(true)
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transfer("read", e)),
        }
    }

    async fn modified(&self, path: &str) -> SyncResult<Option<DateTime<Utc>>> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(meta) => {
                let mtime = meta.modified().map_err(|e| transfer("modified", e))?;
                Ok(Some(DateTime::<Utc>::from(mtime)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transfer("modified", e)),
        }
    }

    async fn checksum(&self, path: &str) -> SyncResult<Option<String>> {
        let target = self.resolve(path);
        tokio::task::spawn_blocking(move || sha256_file_opt(&target))
            .await
            .map_err(|e| SyncError::Transfer {
                op: "checksum",
                reason: e.to_string(),
            })?
            .map_err(|e| transfer("checksum", e))
    }
}
