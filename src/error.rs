//! Domain errors.
//!
//! Messages keep the bracketed prefixes users grep for (`[stack]`, `[ports]`,
//! `[service]`, `[auth]`). Command handlers wrap these in `anyhow` with extra
//! context.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("[stack] stack \"{name}\" does not exist yet\n[stack] expected env file at: {}\n[stack] create it with: hstack stack new {name}", env_path.display())]
    StackMissing { name: String, env_path: PathBuf },

    #[error("[stack] stack \"{0}\" already exists")]
    StackExists(String),

    #[error("[stack] invalid stack name \"{0}\" (use letters, digits, '-' or '_')")]
    InvalidName(String),

    #[error("[stack] \"{0}\" is reserved; use `hstack setup` for the main stack")]
    ReservedName(String),

    #[error("[stack] stack \"{0}\" is running; stop it first")]
    StackRunning(String),

    #[error("[ports] port {port} is already reserved by stack \"{owner}\"")]
    PortReserved { port: u16, owner: String },

    #[error("[ports] port {0} is not available on 127.0.0.1")]
    PortBusy(u16),

    #[error("[ports] no free port found starting at {start} after {attempts} attempts")]
    NoFreePort { start: u16, attempts: u32 },

    #[error("[ports] port {port} is in use by a process not owned by stack \"{stack}\"; refusing to kill it")]
    ForeignListener { port: u16, stack: String },

    #[error("[service] {0}")]
    Service(String),

    #[error("[auth] {0}")]
    Auth(String),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;
