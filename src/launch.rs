//! Process-image substitution into the application
//!
//! The last step of the bootstrap replaces this process with the
//! dashboard server via `execve(2)`. The pid stays the same, so the
//! container runtime's SIGTERM lands on the application itself, and no
//! supervisor sits in between to swallow it.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;
use thiserror::Error;

use crate::identity::ServiceIdentity;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no command given")]
    EmptyCommand,

    #[error("{program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl LaunchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::EmptyCommand => crate::error::EX_USAGE,
            LaunchError::Exec { source, .. } => crate::error::exec_exit_code(source),
        }
    }
}

/// Builds the environment handed to the application
#[derive(Debug, Default, Clone)]
pub struct EnvBuilder {
    vars: BTreeMap<OsString, OsString>,
}

impl EnvBuilder {
    /// Start from an existing environment
    pub fn inherit<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Remove every variable whose name starts with `prefix`
    pub fn strip_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.as_bytes();
        self.vars.retain(|key, _| !key.as_bytes().starts_with(prefix));
        self
    }

    /// HOME, USER and LOGNAME of the service identity
    pub fn identity(self, identity: &ServiceIdentity) -> Self {
        self.set("HOME", identity.home.as_os_str())
            .set("USER", identity.name.as_str())
            .set("LOGNAME", identity.name.as_str())
    }

    pub fn set(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.vars
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    pub fn build(self) -> BTreeMap<OsString, OsString> {
        self.vars
    }
}

/// Everything needed to exec the application
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: BTreeMap<OsString, OsString>,
    pub workdir: Option<PathBuf>,
}

/// Variables whose values `summary` prints; everything else may carry secrets
const SHOWN_ENV: &[&str] = &[
    "HANDOFF_BOOT_ID",
    "HOME",
    "HOST",
    "LOGNAME",
    "PATH",
    "PORT",
    "USER",
];

pub const REDACTED: &str = "<redacted>";

/// Lossy, printable view of a [`LaunchCommand`]. Environment values other
/// than the ones handoff itself sets are replaced with [`REDACTED`].
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSummary {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl LaunchCommand {
    /// Split an argv into program and arguments
    pub fn from_argv<I, S>(
        argv: I,
        env: BTreeMap<OsString, OsString>,
        workdir: Option<PathBuf>,
    ) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .filter(|p| !p.is_empty())
            .ok_or(LaunchError::EmptyCommand)?;
        Ok(Self {
            program,
            args: argv.collect(),
            env,
            workdir,
        })
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn summary(&self) -> LaunchSummary {
        LaunchSummary {
            argv: std::iter::once(&self.program)
                .chain(&self.args)
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| {
                    let key = k.to_string_lossy().into_owned();
                    let value = if SHOWN_ENV.contains(&key.as_str()) {
                        v.to_string_lossy().into_owned()
                    } else {
                        REDACTED.to_string()
                    };
                    (key, value)
                })
                .collect(),
            workdir: self.workdir.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).env_clear().envs(&self.env);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Replace the current process image. Only returns on failure.
    ///
    /// std resets the signal mask and SIGPIPE disposition before
    /// `execvp`, so the application starts with default signal handling.
    pub fn exec(&self) -> LaunchError {
        let source = self.command().exec();
        LaunchError::Exec {
            program: self.program_name(),
            source,
        }
    }
}
