use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "edu";
pub const APP_ORG: &str = "escuela";
pub const APP_NAME: &str = "admissions";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("ADMISSIONS_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn journal_path() -> anyhow::Result<PathBuf> {
    Ok(log_dir()?.join("sync-journal.log"))
}

pub fn default_local_db() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("escuela.db"))
}

/// Directory for ssh control sockets; kept short because unix socket paths are length-limited.
pub fn control_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("ctl"))
}
