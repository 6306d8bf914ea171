//! Bootstrap error taxonomy and exit codes
//!
//! Every error in the bootstrap phase is fatal. Each variant maps to a
//! sysexits-style exit code so the container runtime (and whoever reads
//! `docker inspect`) can tell a bad account name from a failed `setuid`.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::launch::LaunchError;
use crate::ownership::OwnershipError;
use crate::security::DropError;

/// Command line usage error
pub const EX_USAGE: i32 = 64;
/// Account or group cannot be resolved
pub const EX_NOUSER: i32 = 67;
/// Filesystem error during ownership normalization
pub const EX_IOERR: i32 = 74;
/// Missing privilege or failed privilege drop
pub const EX_NOPERM: i32 = 77;
/// Malformed configuration
pub const EX_CONFIG: i32 = 78;
/// Target command exists but cannot be executed
pub const EX_CANNOT_EXEC: i32 = 126;
/// Target command not found
pub const EX_NOT_FOUND: i32 = 127;

/// Anything that can abort the bootstrap before handoff
#[derive(Debug, Error)]
pub enum BootError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("required environment variable {0} is not set")]
    MissingEnv(String),

    #[error("identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("ownership: {0}")]
    Ownership(#[from] OwnershipError),

    #[error("privilege drop: {0}")]
    Drop(#[from] DropError),

    #[error("exec: {0}")]
    Launch(#[from] LaunchError),
}

impl BootError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            BootError::Config(_) | BootError::MissingEnv(_) => EX_CONFIG,
            BootError::Identity(_) => EX_NOUSER,
            BootError::Ownership(_) => EX_IOERR,
            BootError::Drop(_) => EX_NOPERM,
            BootError::Launch(e) => e.exit_code(),
        }
    }

    /// Short stage label used for metrics and log fields
    pub fn stage(&self) -> &'static str {
        match self {
            BootError::Config(_) | BootError::MissingEnv(_) => "config",
            BootError::Identity(_) => "identity",
            BootError::Ownership(_) => "ownership",
            BootError::Drop(_) => "drop",
            BootError::Launch(_) => "exec",
        }
    }
}

/// Map an exec failure's errno to the shell convention (126/127)
pub(crate) fn exec_exit_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => EX_NOT_FOUND,
        _ => EX_CANNOT_EXEC,
    }
}
