//! Advisory lock tokens stored next to the remote database.
//!
//! The lock file holds one JSON [`LockToken`]. Creating it is an atomic
//! exclusive-create on the remote, so of several concurrent claimants exactly
//! one wins. A token past its `expires_at` counts as released no matter who
//! holds it; stale or corrupt files are moved aside with an atomic rename
//! before the next claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteFs;

const MAX_CLAIM_ROUNDS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockToken {
    pub token_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockToken {
    pub fn new(holder: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            token_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}

#[derive(Debug)]
enum Observed {
    Absent,
    Live(LockToken),
    /// Expired token, or `None` for an unreadable file.
    Stale(Option<LockToken>),
}

#[derive(Debug)]
enum Eviction {
    Evicted,
    /// Someone else moved the file first.
    Vanished,
    /// The file turned out to hold a different live token; it was put back.
    Restored(LockToken),
}

pub struct LockManager {
    remote: Arc<dyn RemoteFs>,
    clock: Arc<dyn Clock>,
    lock_path: String,
}

impl LockManager {
    pub fn new(remote: Arc<dyn RemoteFs>, clock: Arc<dyn Clock>, lock_path: impl Into<String>) -> Self {
        Self {
            remote,
            clock,
            lock_path: lock_path.into(),
        }
    }

    pub fn lock_path(&self) -> &str {
        &self.lock_path
    }

    /// Claim the lock for `holder` for `ttl`.
    ///
    /// Fails with `LockContention` while another holder's token is live. A
    /// live token of the same holder is replaced with a fresh one.
    pub async fn acquire(&self, holder: &str, ttl: Duration) -> SyncResult<LockToken> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let token = LockToken::new(holder, self.clock.now(), ttl);
            let bytes = serde_json::to_vec_pretty(&token)?;
            if self.remote.create_exclusive(&self.lock_path, &bytes).await? {
                info!(
                    holder,
                    token_id = %token.token_id,
                    expires_at = %token.expires_at,
                    "lock acquired"
                );
                return Ok(token);
            }
            match self.observe().await? {
                Observed::Absent => continue,
                Observed::Live(existing) if existing.holder != holder => {
                    debug!(holder, current = %existing.holder, "lock contended");
                    return Err(contention(existing));
                }
                Observed::Live(existing) => {
                    debug!(holder, "renewing own lock");
                    if let Eviction::Restored(other) = self.evict(Some(&existing)).await? {
                        return Err(contention(other));
                    }
                }
                Observed::Stale(existing) => {
                    match &existing {
                        Some(t) => warn!(
                            stale_holder = %t.holder,
                            expired_at = %t.expires_at,
                            "evicting expired lock"
                        ),
                        None => warn!(path = %self.lock_path, "evicting unreadable lock file"),
                    }
                    if let Eviction::Restored(other) = self.evict(existing.as_ref()).await? {
                        return Err(contention(other));
                    }
                }
            }
        }
        match self.observe().await? {
            Observed::Live(existing) => Err(contention(existing)),
            _ => Err(SyncError::LockContention {
                holder: "<contended>".into(),
                expires_at: self.clock.now(),
            }),
        }
    }

    /// The token currently stored on the remote, expired or not.
    pub async fn current(&self) -> SyncResult<Option<LockToken>> {
        Ok(self
            .remote
            .read(&self.lock_path)
            .await?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// The current token if it is still live.
    pub async fn live(&self) -> SyncResult<Option<LockToken>> {
        match self.observe().await? {
            Observed::Live(token) => Ok(Some(token)),
            _ => Ok(None),
        }
    }

    /// Confirm `token` is still the live token on the remote.
    pub async fn verify_held(&self, token: &LockToken, op: &'static str) -> SyncResult<()> {
        match self.current().await? {
            Some(current)
                if current.token_id == token.token_id
                    && !current.is_expired_at(self.clock.now()) =>
            {
                Ok(())
            }
            _ => Err(SyncError::LockLost { op }),
        }
    }

    /// Remove the lock file if it still holds `token`.
    pub async fn release(&self, token: &LockToken) -> SyncResult<()> {
        match self.current().await? {
            None => {
                debug!(token_id = %token.token_id, "lock already gone");
                Ok(())
            }
            Some(current) if current.token_id != token.token_id => {
                warn!(
                    token_id = %token.token_id,
                    current_holder = %current.holder,
                    "lock was taken over; nothing to release"
                );
                Ok(())
            }
            Some(_) => match self.evict(Some(token)).await? {
                Eviction::Evicted => {
                    info!(holder = %token.holder, token_id = %token.token_id, "lock released");
                    Ok(())
                }
                Eviction::Vanished => Ok(()),
                Eviction::Restored(other) => {
                    warn!(current_holder = %other.holder, "lock was taken over during release");
                    Ok(())
                }
            },
        }
    }

    async fn observe(&self) -> SyncResult<Observed> {
        let Some(bytes) = self.remote.read(&self.lock_path).await? else {
            return Ok(Observed::Absent);
        };
        match serde_json::from_slice::<LockToken>(&bytes) {
            Ok(token) if token.is_expired_at(self.clock.now()) => Ok(Observed::Stale(Some(token))),
            Ok(token) => Ok(Observed::Live(token)),
            Err(_) => Ok(Observed::Stale(None)),
        }
    }

    /// Move the lock file aside, then delete it. If what was moved is not the
    /// token we meant to remove and it is still live, put it back.
    async fn evict(&self, expected: Option<&LockToken>) -> SyncResult<Eviction> {
        let archive = format!("{}.evicted-{}", self.lock_path, Uuid::new_v4().simple());
        if !self.remote.rename(&self.lock_path, &archive).await? {
            return Ok(Eviction::Vanished);
        }
        let moved: Option<LockToken> = self
            .remote
            .read(&archive)
            .await?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        let now = self.clock.now();
        if let Some(got) = moved {
            let expected_match = expected.is_some_and(|e| e.token_id == got.token_id);
            if !expected_match && !got.is_expired_at(now) {
                let bytes = serde_json::to_vec_pretty(&got)?;
                if !self.remote.create_exclusive(&self.lock_path, &bytes).await? {
                    warn!(holder = %got.holder, "could not restore displaced lock token");
                }
                self.remote.remove(&archive).await?;
                return Ok(Eviction::Restored(got));
            }
        }
        self.remote.remove(&archive).await?;
        Ok(Eviction::Evicted)
    }
}

fn contention(token: LockToken) -> SyncError {
    SyncError::LockContention {
        holder: token.holder,
        expires_at: token.expires_at,
    }
}
