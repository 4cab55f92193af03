use chrono::{DateTime, Utc};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{op}: remote channel unavailable: {reason}")]
    Connection { op: &'static str, reason: String },

    #[error("lock held by {holder} until {expires_at}")]
    LockContention {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("{op}: lock token no longer held by this session")]
    LockLost { op: &'static str },

    #[error("{op}: transfer interrupted: {reason}")]
    Transfer { op: &'static str, reason: String },

    #[error("no remote copy at {path}")]
    RemoteMissing { path: String },

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Network-level failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection { .. } | SyncError::Transfer { .. })
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, SyncError::LockContention { .. })
    }

    pub(crate) fn io(op: &'static str, source: std::io::Error) -> Self {
        SyncError::Io { op, source }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("invalid password")]
    InvalidPassword,

    #[error("user already exists: {0}")]
    DuplicateUser(String),

    #[error("password must not be empty")]
    WeakPassword,

    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    #[error("no local database at {0}; pull it first")]
    MissingDatabase(String),

    #[error("credential storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("stored credential is malformed: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_transient() {
        let conn = SyncError::Connection {
            op: "connect",
            reason: "timed out".into(),
        };
        let transfer = SyncError::Transfer {
            op: "upload",
            reason: "broken pipe".into(),
        };
        let contention = SyncError::LockContention {
            holder: "staff1@office".into(),
            expires_at: Utc::now(),
        };
        let missing = SyncError::RemoteMissing {
            path: "/srv/escuela.db".into(),
        };
        assert!(conn.is_transient());
        assert!(transfer.is_transient());
        assert!(!contention.is_transient());
        assert!(contention.is_lock_contention());
        assert!(!missing.is_transient());
    }

    #[test]
    fn messages_carry_operation_context() {
        let err = SyncError::Transfer {
            op: "push_local",
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "push_local: transfer interrupted: connection reset"
        );
    }
}
