use admissions_core::credentials::{CredentialStore, Role};
use admissions_core::error::{AuthError, SyncError};
use admissions_core::journal::{Journal, Outcome};
use admissions_core::paths::{control_dir, journal_path, log_dir, settings_path};
use admissions_core::remote::{RemoteFs, SshRemote};
use admissions_core::session::{ReconcileOutcome, SyncSession};
use admissions_core::settings::{load_settings, SyncSettings};
use admissions_core::SystemClock;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const JOURNAL_MAX_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "admissions", version, about = "Sync the admissions database with the office server", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local database copy, overriding the settings file
    #[arg(long, global = true)]
    local_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download the remote database over the local copy
    Pull,
    /// Publish the local copy as the remote database (takes the write lock)
    Push,
    /// Make local and remote agree, last writer wins
    Reconcile,
    /// Inspect or clear the write lock
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Manage staff logins
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Show recent sync activity
    Journal {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Check the hash chain of the current journal file
        #[arg(long)]
        verify: bool,
    },
    /// Settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LockCommands {
    /// Show the current lock token
    Status,
    /// Drop a lock left behind by this holder
    Release,
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    /// Create a login and publish it
    Add {
        username: String,
        #[arg(long, default_value = "staff")]
        role: Role,
    },
    /// Check a password against the local copy
    Verify {
        username: String,
        /// Pull the remote database first
        #[arg(long)]
        pull: bool,
    },
    /// Change a password and publish it
    Passwd { username: String },
    /// List logins in the local copy
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
}

struct App {
    settings: SyncSettings,
    settings_path: PathBuf,
    journal: Arc<Journal>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let app = load_app(&cli)?;

    match cli.command {
        Commands::Pull => pull_command(&app).await,
        Commands::Push => push_command(&app).await,
        Commands::Reconcile => reconcile_command(&app).await,
        Commands::Lock { command } => match command {
            LockCommands::Status => lock_status_command(&app).await,
            LockCommands::Release => lock_release_command(&app).await,
        },
        Commands::User { command } => match command {
            UserCommands::Add { username, role } => user_add_command(&app, username, role).await,
            UserCommands::Verify { username, pull } => {
                user_verify_command(&app, &username, pull).await
            }
            UserCommands::Passwd { username } => user_passwd_command(&app, username).await,
            UserCommands::List => user_list_command(&app),
        },
        Commands::Journal { limit, verify } => journal_command(&app, limit, verify),
        Commands::Config { command } => match command {
            ConfigCommands::Show => config_show_command(&app),
        },
    }
}

fn load_app(cli: &Cli) -> Result<App> {
    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => settings_path()?,
    };
    let mut settings = load_settings(&settings_path)?;
    settings.apply_env();
    if let Some(local) = &cli.local_db {
        settings.local_db_path = local.clone();
    }
    std::fs::create_dir_all(log_dir()?)?;
    let journal = Arc::new(Journal::open(journal_path()?, JOURNAL_MAX_BYTES)?);
    Ok(App {
        settings,
        settings_path,
        journal,
    })
}

async fn open_session(app: &App) -> Result<SyncSession> {
    app.settings
        .validate()
        .with_context(|| format!("invalid settings in {}", app.settings_path.display()))?;
    let control = control_dir()?;
    std::fs::create_dir_all(&control)?;
    let remote: Arc<dyn RemoteFs> = Arc::new(SshRemote::new(&app.settings, &control));
    let session = SyncSession::open(app.settings.clone(), remote, Arc::new(SystemClock))
        .await
        .with_context(|| format!("cannot reach {}", app.settings.remote.host))?;
    Ok(session.with_notifier(app.journal.clone()))
}

/// Close the session on every path; a close failure only matters when the
/// command itself succeeded.
async fn finish<T>(session: SyncSession, result: Result<T>) -> Result<T> {
    let closed = session.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "session close failed");
            Err(e)
        }
    }
}

async fn pull_command(app: &App) -> Result<()> {
    let mut session = open_session(app).await?;
    let local = app.settings.local_db_path.clone();
    let result = session.fetch_remote(&local).await.map_err(anyhow::Error::from);
    let checksum = finish(session, result).await?;
    println!("pulled {} sha256 {}", local.display(), checksum);
    Ok(())
}

async fn push_command(app: &App) -> Result<()> {
    let local = app.settings.local_db_path.clone();
    if !local.exists() {
        return Err(anyhow!("no local database at {}", local.display()));
    }
    let mut session = open_session(app).await?;
    let path = local.clone();
    let result = session
        .with_write_lock(move |s| Box::pin(async move { s.push_local(&path).await }))
        .await
        .map_err(anyhow::Error::from);
    let checksum = finish(session, result).await?;
    println!("pushed {} sha256 {}", local.display(), checksum);
    Ok(())
}

async fn reconcile_command(app: &App) -> Result<()> {
    let mut session = open_session(app).await?;
    let local = app.settings.local_db_path.clone();
    let result = session.reconcile(&local).await.map_err(anyhow::Error::from);
    let outcome = finish(session, result).await?;
    match outcome {
        ReconcileOutcome::InSync { checksum } => println!("in sync sha256 {checksum}"),
        ReconcileOutcome::PulledRemote { checksum } => println!("pulled remote sha256 {checksum}"),
        ReconcileOutcome::PushedLocal { checksum } => println!("pushed local sha256 {checksum}"),
        ReconcileOutcome::InitializedRemote { checksum } => {
            println!("initialized remote sha256 {checksum}")
        }
        ReconcileOutcome::NothingToSync => println!("no database on either side"),
    }
    Ok(())
}

async fn lock_status_command(app: &App) -> Result<()> {
    let session = open_session(app).await?;
    let result = session.locks().current().await.map_err(anyhow::Error::from);
    let token = finish(session, result).await?;
    match token {
        None => println!("unlocked"),
        Some(token) => {
            let now = Utc::now();
            let state = if token.is_expired_at(now) { "expired" } else { "live" };
            println!(
                "{state}: held by {} since {}, expires {} ({}s left)",
                token.holder,
                token.acquired_at,
                token.expires_at,
                token.remaining_at(now).num_seconds()
            );
        }
    }
    Ok(())
}

async fn lock_release_command(app: &App) -> Result<()> {
    let session = open_session(app).await?;
    let result = release_own_lock(&session).await;
    let message = finish(session, result).await?;
    println!("{message}");
    Ok(())
}

async fn release_own_lock(session: &SyncSession) -> Result<String> {
    match session.locks().current().await? {
        None => Ok("no lock to release".to_string()),
        Some(token) if token.holder == session.holder() || token.is_expired_at(Utc::now()) => {
            session.locks().release(&token).await?;
            Ok(format!("released lock of {}", token.holder))
        }
        Some(token) => Err(anyhow!(
            "lock is held by {} until {}; only its holder can release it",
            token.holder,
            token.expires_at
        )),
    }
}

/// Run a credential change under the write lock: refresh from the remote,
/// apply `change` to the local copy, and publish it only if it succeeded.
async fn publish_user_change<F>(app: &App, change: F) -> Result<()>
where
    F: FnOnce(&CredentialStore) -> Result<(), AuthError> + Send + 'static,
{
    let mut session = open_session(app).await?;
    let local = app.settings.local_db_path.clone();
    let result = session
        .with_write_lock(move |s| {
            Box::pin(async move {
                match s.fetch_remote(&local).await {
                    Ok(_) | Err(SyncError::RemoteMissing { .. }) => {}
                    Err(e) => return Err(e),
                }
                let changed = CredentialStore::open(&local).and_then(|store| change(&store));
                if changed.is_ok() {
                    s.push_local(&local).await?;
                }
                Ok(changed)
            })
        })
        .await
        .map_err(anyhow::Error::from);
    finish(session, result).await??;
    Ok(())
}

async fn user_add_command(app: &App, username: String, role: Role) -> Result<()> {
    let password = prompt_new_password(&format!("Password for {username}"))?;
    let name = username.clone();
    publish_user_change(app, move |store| store.provision(&name, &password, role)).await?;
    println!("added {username} ({role})");
    Ok(())
}

async fn user_passwd_command(app: &App, username: String) -> Result<()> {
    let current = prompt_password("Current password")?;
    let new_password = prompt_new_password("New password")?;
    let name = username.clone();
    publish_user_change(app, move |store| {
        store.change_password(&name, &current, &new_password)
    })
    .await?;
    println!("password changed for {username}");
    Ok(())
}

async fn user_verify_command(app: &App, username: &str, pull: bool) -> Result<()> {
    if pull {
        pull_command(app).await?;
    }
    let password = prompt_password("Password")?;
    let store = CredentialStore::open_existing(&app.settings.local_db_path)?;
    match store.verify(username, &password) {
        Ok(role) => {
            println!("ok: {username} ({role})");
            Ok(())
        }
        // one message for both so the CLI does not reveal which usernames exist
        Err(AuthError::UnknownUser(_)) | Err(AuthError::InvalidPassword) => {
            Err(anyhow!("invalid username or password"))
        }
        Err(e) => Err(e.into()),
    }
}

fn user_list_command(app: &App) -> Result<()> {
    let store = CredentialStore::open_existing(&app.settings.local_db_path)?;
    let users = store.list_users()?;
    if users.is_empty() {
        println!("no users");
    }
    for user in users {
        println!("{:<24} {:<10} updated {}", user.username, user.role, user.updated_at);
    }
    Ok(())
}

fn journal_command(app: &App, limit: usize, verify: bool) -> Result<()> {
    if verify {
        app.journal.verify_chain()?;
        println!("journal chain intact: {}", app.journal.path().display());
    }
    for entry in app.journal.read_recent(Some(limit))? {
        let marker = match entry.event.outcome {
            Outcome::Success => "ok  ",
            Outcome::Failure => "FAIL",
        };
        println!(
            "{} {marker} {:<14} {:<12} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.event.operation,
            entry.event.holder,
            entry.event.detail
        );
    }
    Ok(())
}

fn config_show_command(app: &App) -> Result<()> {
    println!("# {}", app.settings_path.display());
    println!("{}", serde_json::to_string_pretty(&app.settings)?);
    Ok(())
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let pw = rpassword::prompt_password(format!("{prompt}: "))
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let first = prompt_password(prompt)?;
    if first.is_empty() {
        return Err(anyhow!("password must not be empty"));
    }
    let second = prompt_password("Confirm password")?;
    if *first != *second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
