use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::RemoteFs;
use crate::error::{SyncError, SyncResult};
use crate::settings::SyncSettings;

/// ssh reserves 255 for its own failures (auth, network, host key).
const SSH_FAILURE_EXIT: i32 = 255;
const MISSING_EXIT: i32 = 66;
const EXISTS_EXIT: i32 = 73;

/// Remote file access over the system OpenSSH client.
///
/// One master connection is opened per session (`ControlMaster`) and every
/// operation is multiplexed over it, so authentication happens once.
#[derive(Debug)]
pub struct SshRemote {
    destination: String,
    port: u16,
    identity_file: Option<PathBuf>,
    ssh_options: Vec<String>,
    control_path: PathBuf,
    connect_timeout: Duration,
    op_timeout: Duration,
    /// Idle lifetime of the master connection; an orphaned master exits on its own.
    persist: Duration,
    connected: AtomicBool,
}

struct RunOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

impl SshRemote {
    pub fn new(settings: &SyncSettings, control_dir: &Path) -> Self {
        let remote = &settings.remote;
        let destination = match &remote.user {
            Some(user) => format!("{}@{}", user, remote.host),
            None => remote.host.clone(),
        };
        let control_path = control_dir.join(format!("cm-{}", uuid::Uuid::new_v4().simple()));
        Self {
            destination,
            port: remote.port,
            identity_file: remote.identity_file.clone(),
            ssh_options: remote.ssh_options.clone(),
            control_path,
            connect_timeout: settings.connect_timeout(),
            op_timeout: settings.transfer_timeout(),
            persist: settings.connect_timeout() + settings.transfer_timeout(),
            connected: AtomicBool::new(false),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ServerAliveInterval=5")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        for opt in &self.ssh_options {
            cmd.arg("-o").arg(opt);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn master_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "ControlMaster=yes".into(),
            "-o".into(),
            format!("ControlPersist={}s", self.persist.as_secs().max(1)),
            "-f".into(),
            "-N".into(),
        ]
    }

    async fn run(
        &self,
        op: &'static str,
        script: &str,
        stdin: Stdio,
        stdout: Option<Stdio>,
    ) -> SyncResult<RunOutput> {
        debug!(op, destination = %self.destination, script, "ssh exec");
        let capture = stdout.is_none();
        let mut cmd = self.base_command();
        cmd.arg(&self.destination)
            .arg("--")
            .arg(script)
            .stdin(stdin)
            .stdout(stdout.unwrap_or_else(Stdio::piped))
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| SyncError::Connection {
            op,
            reason: format!("spawn ssh: {e}"),
        })?;
        let output = tokio::time::timeout(self.op_timeout, child.wait_with_output())
            .await
            .map_err(|_| SyncError::Connection {
                op,
                reason: format!("timed out after {}s", self.op_timeout.as_secs()),
            })?
            .map_err(|e| SyncError::Transfer {
                op,
                reason: e.to_string(),
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.code() == Some(SSH_FAILURE_EXIT) {
            return Err(SyncError::Connection { op, reason: stderr });
        }
        Ok(RunOutput {
            status: output.status,
            stdout: if capture { output.stdout } else { Vec::new() },
            stderr,
        })
    }

    async fn run_simple(&self, op: &'static str, script: &str) -> SyncResult<RunOutput> {
        self.run(op, script, Stdio::null(), None).await
    }
}

/// Quote `s` for a POSIX shell as a single word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn parent_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string())
}

fn failed(op: &'static str, out: &RunOutput) -> SyncError {
    SyncError::Transfer {
        op,
        reason: format!(
            "remote exited with {}: {}",
            out.status.code().unwrap_or(-1),
            out.stderr
        ),
    }
}

fn local_io(op: &'static str, e: std::io::Error) -> SyncError {
    SyncError::io(op, e)
}

#[async_trait]
impl RemoteFs for SshRemote {
    fn describe(&self) -> String {
        format!("ssh://{}:{}", self.destination, self.port)
    }

    async fn connect(&self) -> SyncResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(parent) = self.control_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| local_io("connect", e))?;
        }
        let mut cmd = self.base_command();
        cmd.args(self.master_args())
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| SyncError::Connection {
            op: "connect",
            reason: format!("spawn ssh: {e}"),
        })?;
        // ssh -f detaches only after authentication, so this bounds the handshake.
        let output = tokio::time::timeout(
            self.connect_timeout + Duration::from_secs(1),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| SyncError::Connection {
            op: "connect",
            reason: format!("timed out after {}s", self.connect_timeout.as_secs()),
        })?
        .map_err(|e| SyncError::Connection {
            op: "connect",
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(SyncError::Connection {
                op: "connect",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(destination = %self.destination, "remote channel established");
        Ok(())
    }

    async fn close(&self) -> SyncResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut cmd = self.base_command();
        cmd.arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(self.connect_timeout, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(destination = %self.destination, "remote channel closed");
            }
            Ok(Ok(status)) => warn!(%status, "ssh master exit returned failure"),
            Ok(Err(e)) => warn!(error = %e, "cannot stop ssh master"),
            Err(_) => warn!("timed out stopping ssh master"),
        }
        let _ = std::fs::remove_file(&self.control_path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> SyncResult<bool> {
        let q = shell_quote(path);
        let out = self
            .run_simple("exists", &format!("if [ -e {q} ]; then exit 0; else exit {MISSING_EXIT}; fi"))
            .await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(MISSING_EXIT) => Ok(false),
            _ => Err(failed("exists", &out)),
        }
    }

    async fn download(&self, remote: &str, local: &Path) -> SyncResult<()> {
        let q = shell_quote(remote);
        let file = std::fs::File::create(local).map_err(|e| local_io("download", e))?;
        let out = self
            .run(
                "download",
                &format!("if [ -f {q} ]; then exec cat {q}; else exit {MISSING_EXIT}; fi"),
                Stdio::null(),
                Some(Stdio::from(file)),
            )
            .await?;
        match out.status.code() {
            Some(0) => Ok(()),
            Some(MISSING_EXIT) => Err(SyncError::RemoteMissing {
                path: remote.to_string(),
            }),
            _ => Err(failed("download", &out)),
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> SyncResult<()> {
        let file = std::fs::File::open(local).map_err(|e| local_io("upload", e))?;
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent_of(remote)),
            shell_quote(remote)
        );
        let out = self.run("upload", &script, Stdio::from(file), None).await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(failed("upload", &out))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> SyncResult<bool> {
        let (f, t) = (shell_quote(from), shell_quote(to));
        let out = self
            .run_simple(
                "rename",
                &format!("if [ -e {f} ]; then exec mv -f {f} {t}; else exit {MISSING_EXIT}; fi"),
            )
            .await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(MISSING_EXIT) => Ok(false),
            _ => Err(failed("rename", &out)),
        }
    }

    async fn remove(&self, path: &str) -> SyncResult<()> {
        let out = self
            .run_simple("remove", &format!("rm -f {}", shell_quote(path)))
            .await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(failed("remove", &out))
        }
    }

    async fn create_exclusive(&self, path: &str, contents: &[u8]) -> SyncResult<bool> {
        // write the whole token to a scratch file, then link(2) it into place;
        // the link fails if the lock already exists and readers never see a
        // half-written token.
        let parent = parent_of(path);
        let script = format!(
            "mkdir -p {dir} && t=$(mktemp {scratch}) && cat > \"$t\" || exit 1; \
             if ln \"$t\" {dest} 2>/dev/null; then rm -f \"$t\"; else rm -f \"$t\"; exit {EXISTS_EXIT}; fi",
            dir = shell_quote(&parent),
            scratch = shell_quote(&format!("{}/.claim.XXXXXX", parent.trim_end_matches('/'))),
            dest = shell_quote(path)
        );
        let staged = tempfile::NamedTempFile::new().map_err(|e| local_io("create_exclusive", e))?;
        std::fs::write(staged.path(), contents).map_err(|e| local_io("create_exclusive", e))?;
        let stdin = std::fs::File::open(staged.path()).map_err(|e| local_io("create_exclusive", e))?;
        let out = self
            .run("create_exclusive", &script, Stdio::from(stdin), None)
            .await?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(EXISTS_EXIT) => Ok(false),
            _ => Err(failed("create_exclusive", &out)),
        }
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let q = shell_quote(path);
        let out = self
            .run_simple(
                "read",
                &format!("if [ -f {q} ]; then exec cat {q}; else exit {MISSING_EXIT}; fi"),
            )
            .await?;
        match out.status.code() {
            Some(0) => Ok(Some(out.stdout)),
            Some(MISSING_EXIT) => Ok(None),
            _ => Err(failed("read", &out)),
        }
    }

    async fn modified(&self, path: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let q = shell_quote(path);
        let out = self
            .run_simple(
                "modified",
                &format!("if [ -e {q} ]; then exec stat -c %Y {q}; else exit {MISSING_EXIT}; fi"),
            )
            .await?;
        match out.status.code() {
            Some(0) => {
                let text = String::from_utf8_lossy(&out.stdout);
                let secs: i64 = text.trim().parse().map_err(|_| SyncError::Transfer {
                    op: "modified",
                    reason: format!("unexpected stat output {:?}", text.trim()),
                })?;
                Ok(DateTime::<Utc>::from_timestamp(secs, 0))
            }
            Some(MISSING_EXIT) => Ok(None),
            _ => Err(failed("modified", &out)),
        }
    }

    async fn checksum(&self, path: &str) -> SyncResult<Option<String>> {
        let q = shell_quote(path);
        let out = self
            .run_simple(
                "checksum",
                &format!("if [ -f {q} ]; then exec sha256sum {q}; else exit {MISSING_EXIT}; fi"),
            )
            .await?;
        match out.status.code() {
            Some(0) => {
                let text = String::from_utf8_lossy(&out.stdout);
                text.split_whitespace()
                    .next()
                    .map(|sum| Some(sum.to_ascii_lowercase()))
                    .ok_or_else(|| SyncError::Transfer {
                        op: "checksum",
                        reason: "empty sha256sum output".into(),
                    })
            }
            Some(MISSING_EXIT) => Ok(None),
            _ => Err(failed("checksum", &out)),
        }
    }
}
