use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSettings {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Absolute path of the authoritative database on the remote host.
    pub db_path: String,
    /// Extra `-o Key=Value` options handed to ssh verbatim.
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockSettings {
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub connect_secs: u64,
    pub transfer_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    pub transient: RetryPolicy,
    pub lock_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub remote: RemoteSettings,
    pub local_db_path: PathBuf,
    pub lock: LockSettings,
    pub timeouts: TimeoutSettings,
    pub retry: RetrySettings,
    #[serde(default = "default_holder")]
    pub holder: String,
}

impl SyncSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.transfer_secs)
    }

    /// Remote path of the advisory lock file guarding `remote.db_path`.
    pub fn lock_path(&self) -> String {
        format!("{}.lock", self.remote.db_path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.remote.host.trim().is_empty() {
            return Err(anyhow!("remote.host is empty"));
        }
        if self.remote.db_path.trim().is_empty() {
            return Err(anyhow!("remote.db_path is empty"));
        }
        if self.lock.ttl_secs == 0 {
            return Err(anyhow!("lock.ttl_secs must be positive"));
        }
        if self.timeouts.connect_secs == 0 || self.timeouts.transfer_secs == 0 {
            return Err(anyhow!("timeouts must be positive"));
        }
        if self.retry.transient.max_attempts == 0 || self.retry.lock_attempts == 0 {
            return Err(anyhow!("retry attempts must be at least 1"));
        }
        Ok(())
    }

    /// Apply `ADMISSIONS_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        if let Some(host) = get("ADMISSIONS_REMOTE_HOST") {
            self.remote.host = host;
        }
        if let Some(user) = get("ADMISSIONS_REMOTE_USER") {
            self.remote.user = Some(user);
        }
        if let Some(path) = get("ADMISSIONS_REMOTE_PATH") {
            self.remote.db_path = path;
        }
        if let Some(local) = get("ADMISSIONS_LOCAL_DB") {
            self.local_db_path = PathBuf::from(local);
        }
        if let Some(holder) = get("ADMISSIONS_HOLDER") {
            self.holder = holder;
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote: RemoteSettings {
                host: String::new(),
                user: None,
                port: default_port(),
                identity_file: None,
                db_path: "/srv/escuela/escuela.db".into(),
                ssh_options: vec![],
            },
            local_db_path: crate::paths::default_local_db()
                .unwrap_or_else(|_| PathBuf::from("escuela.db")),
            lock: LockSettings { ttl_secs: 60 },
            timeouts: TimeoutSettings {
                connect_secs: 15,
                transfer_secs: 30,
            },
            retry: RetrySettings {
                transient: RetryPolicy::default(),
                lock_attempts: 3,
            },
            holder: default_holder(),
        }
    }
}

pub fn load_settings(path: &Path) -> anyhow::Result<SyncSettings> {
    if path.exists() {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read settings {}", path.display()))?;
        Ok(serde_json::from_str(&json)
            .with_context(|| format!("parse settings {}", path.display()))?)
    } else {
        Ok(SyncSettings::default())
    }
}

pub fn save_settings(path: &Path, settings: &SyncSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(settings)?;
    std::fs::write(path, data)?;
    Ok(())
}

fn default_port() -> u16 {
    22
}

fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".into());
    format!("{user}@{host}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn configured() -> SyncSettings {
        let mut s = SyncSettings::default();
        s.remote.host = "db.escuela.local".into();
        s
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let loaded = load_settings(&dir.path().join("settings.json")).unwrap();
        assert_eq!(loaded.lock.ttl_secs, 60);
        assert_eq!(loaded.timeouts.transfer_secs, 30);
        assert_eq!(loaded.retry.lock_attempts, 3);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = configured();
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn env_overrides_win() {
        let mut s = configured();
        let env: HashMap<&str, &str> = [
            ("ADMISSIONS_REMOTE_HOST", "backup.escuela.local"),
            ("ADMISSIONS_REMOTE_PATH", "/data/aspirantes.db"),
            ("ADMISSIONS_HOLDER", "migracion-job"),
        ]
        .into_iter()
        .collect();
        s.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.remote.host, "backup.escuela.local");
        assert_eq!(s.lock_path(), "/data/aspirantes.db.lock");
        assert_eq!(s.holder, "migracion-job");
        assert!(s.remote.user.is_none());
    }

    #[test]
    fn validate_rejects_unbounded_settings() {
        assert!(SyncSettings::default().validate().is_err());
        let mut s = configured();
        assert!(s.validate().is_ok());
        s.timeouts.transfer_secs = 0;
        assert!(s.validate().is_err());
        let mut s = configured();
        s.lock.ttl_secs = 0;
        assert!(s.validate().is_err());
    }
}
