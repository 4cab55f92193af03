//! admissions-core: keeps the admissions database consistent between a local
//! cache and a single remote copy.
//!
//! # Sync model
//! One remote file is authoritative. Writers serialize through an advisory
//! lock token stored next to it (`<remote>.lock`), created with an atomic
//! exclusive-create and always carrying an expiry so an abandoned session can
//! never lock everyone out. Uploads land in a temporary remote path and are
//! renamed into place; downloads do the same locally. Divergent copies are
//! resolved last-writer-wins by modification time, with no field merge.
//!
//! # Credentials
//! Staff logins live in the `users` table of the same SQLite file as Argon2id
//! PHC strings.

pub mod clock;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod journal;
pub mod lock;
pub mod paths;
pub mod remote;
pub mod retry;
pub mod session;
pub mod settings;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialStore, Role};
pub use error::{AuthError, SyncError};
pub use journal::{Journal, Notifier, SyncEvent, TracingNotifier};
pub use lock::{LockManager, LockToken};
pub use remote::{DirRemote, RemoteFs, SshRemote};
pub use retry::RetryPolicy;
pub use session::{ReconcileOutcome, SyncSession};
pub use settings::SyncSettings;
