//! Staff credentials stored in the `users` table of the admissions database.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::AuthError;

pub const KDF_TIME_COST: u32 = 2;
pub const KDF_MEMORY_COST: u32 = 19_456; // 19 MiB
pub const KDF_PARALLELISM: u32 = 1;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Staff,
    ReadOnly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::ReadOnly => "read-only",
        }
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, Role::ReadOnly)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "staff" => Ok(Role::Staff),
            "read-only" | "readonly" => Ok(Role::ReadOnly),
            other => Err(AuthError::Corrupt(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserSummary {
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CredentialStore {
    conn: Mutex<Connection>,
    argon: Argon2<'static>,
    /// Verified against when the user does not exist, so both paths cost one hash.
    decoy_hash: String,
}

impl CredentialStore {
    /// Open (or create) the credential tables in the database at `path`.
    ///
    /// The rollback journal is used instead of WAL: the database travels as a
    /// single file, and committed pages must never sit in a `-wal` sidecar.
    pub fn open(path: &Path) -> Result<Self, AuthError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::from_connection(conn, true)
    }

    /// Open an existing database read-only, for lookups.
    ///
    /// Never creates the file and never migrates, so a login check on a
    /// machine without a local copy leaves nothing behind that reconciliation
    /// could mistake for a newer write.
    pub fn open_existing(path: &Path) -> Result<Self, AuthError> {
        if !path.is_file() {
            return Err(AuthError::MissingDatabase(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn, false)
    }

    pub fn open_in_memory() -> Result<Self, AuthError> {
        Self::from_connection(Connection::open_in_memory()?, true)
    }

    fn from_connection(conn: Connection, migrate: bool) -> Result<Self, AuthError> {
        let params = Params::new(KDF_MEMORY_COST, KDF_TIME_COST, KDF_PARALLELISM, None)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let decoy_hash = hash_with(&argon, "decoy-password-never-matches")?;
        let store = Self {
            conn: Mutex::new(conn),
            argon,
            decoy_hash,
        };
        if migrate {
            store.migrate()?;
        }
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AuthError> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    username TEXT PRIMARY KEY,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('admin', 'staff', 'read-only')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    /// Create a new account. The password is salted and hashed with Argon2id.
    pub fn provision(&self, username: &str, password: &str, role: Role) -> Result<(), AuthError> {
        let username = normalize(username)?;
        if password.is_empty() {
            return Err(AuthError::WeakPassword);
        }
        let hash = hash_with(&self.argon, password)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        match conn.execute(
            "INSERT INTO users (username, password_hash, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![username, hash, role.as_str(), now],
        ) {
            Ok(_) => {
                info!(username, %role, "user provisioned");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(AuthError::DuplicateUser(username.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check a login attempt and return the user's role.
    pub fn verify(&self, username: &str, password: &str) -> Result<Role, AuthError> {
        let username = username.trim();
        let row: Option<(String, String)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT password_hash, role FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        let Some((hash, role)) = row else {
            let _ = self.matches(&self.decoy_hash, password);
            debug!(username, "login for unknown user");
            return Err(AuthError::UnknownUser(username.to_string()));
        };
        if self.matches(&hash, password)? {
            role.parse()
        } else {
            debug!(username, "login with wrong password");
            Err(AuthError::InvalidPassword)
        }
    }

    /// Replace a password after confirming the current one.
    pub fn change_password(
        &self,
        username: &str,
        current: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        self.verify(username, current)?;
        if new_password.is_empty() {
            return Err(AuthError::WeakPassword);
        }
        let hash = hash_with(&self.argon, new_password)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE username = ?3",
            params![hash, Utc::now().to_rfc3339(), username.trim()],
        )?;
        info!(username = username.trim(), "password changed");
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, AuthError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT username, role, created_at, updated_at FROM users ORDER BY username",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut users = Vec::new();
        for row in rows {
            let (username, role, created_at, updated_at) = row?;
            users.push(UserSummary {
                username,
                role: role.parse()?,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(users)
    }

    fn matches(&self, stored: &str, password: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Corrupt(e.to_string()))?;
        // verify_password compares digests in constant time
        match self.argon.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Hashing(e.to_string())),
        }
    }
}

fn hash_with(argon: &Argon2<'_>, password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    argon
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

fn normalize(username: &str) -> Result<&str, AuthError> {
    let trimmed = username.trim();
    if trimmed.is_empty() || trimmed.len() > 64 || trimmed.chars().any(char::is_control) {
        return Err(AuthError::InvalidUsername(username.to_string()));
    }
    Ok(trimmed)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, AuthError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AuthError::Corrupt(format!("timestamp {value:?}: {e}")))
}
