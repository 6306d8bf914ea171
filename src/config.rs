//! Environment-driven bootstrap configuration
//!
//! The container entrypoint takes no required arguments. Everything it
//! needs comes from the environment the image (or `docker run -e`) sets:
//!
//! ```text
//! HANDOFF_USER=app                 HOST=0.0.0.0
//! HANDOFF_APP_ROOT=/app            PORT=8050
//! HANDOFF_REQUIRE_ENV=SECRET_KEY   DEBUG=1
//! ```
//!
//! Parsing goes through a lookup function so tests can feed a map
//! instead of mutating the process environment.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::identity::IdentitySpec;

/// Default service account, created in the Dockerfile
pub const DEFAULT_USER: &str = "app";

/// Default application root inside the image
pub const DEFAULT_APP_ROOT: &str = "/app";

/// Default listen host for the dashboard server
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port (the one the image EXPOSEs)
pub const DEFAULT_PORT: u16 = 8050;

/// Default WSGI entry point for the dashboard
pub const DEFAULT_APP_MODULE: &str = "app.main:app";

/// Prefix of the variables this crate consumes; stripped from the app env
pub const ENV_PREFIX: &str = "HANDOFF_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Address the downstream application listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl ListenAddr {
    /// HOST and PORT, with the image defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::invalid("PORT", format!("{:?} is not a TCP port", raw)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
        })
    }

    /// `host:port` as passed to `gunicorn --bind`
    pub fn bind_string(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Everything the entrypoint needs, resolved once at startup
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Service identity to drop to
    pub user: IdentitySpec,
    /// Application root, always normalized
    pub app_root: PathBuf,
    /// Additional paths (volumes) to normalize
    pub extra_paths: Vec<PathBuf>,
    /// Skip ownership normalization entirely
    pub skip_chown: bool,
    /// Give the owner read/write (and search on directories)
    pub fix_modes: bool,
    /// Variables that must be present before handoff
    pub required_env: Vec<String>,
    /// Set PR_SET_NO_NEW_PRIVS before exec
    pub no_new_privs: bool,
    /// WSGI module for the default command
    pub app_module: String,
    pub listen: ListenAddr,
    pub debug: bool,
    pub metrics_file: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl BootConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(|key| env.get(key).cloned())
    }

    /// Load from an arbitrary lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let user = get("HANDOFF_USER")
            .unwrap_or_else(|| DEFAULT_USER.to_string())
            .parse::<IdentitySpec>()
            .map_err(|e| ConfigError::invalid("HANDOFF_USER", e.to_string()))?;

        let app_root = PathBuf::from(
            get("HANDOFF_APP_ROOT").unwrap_or_else(|| DEFAULT_APP_ROOT.to_string()),
        );
        if !app_root.is_absolute() {
            return Err(ConfigError::invalid("HANDOFF_APP_ROOT", "must be an absolute path"));
        }

        let extra_paths = match get("HANDOFF_CHOWN_PATHS") {
            Some(raw) => parse_path_list(&raw)?,
            None => Vec::new(),
        };

        let log_format = match get("HANDOFF_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "HANDOFF_LOG_FORMAT",
                    format!("{:?} is not one of text, json", other),
                ))
            }
        };

        Ok(Self {
            user,
            app_root,
            extra_paths,
            skip_chown: parse_bool("HANDOFF_SKIP_CHOWN", get("HANDOFF_SKIP_CHOWN"), false)?,
            fix_modes: parse_bool("HANDOFF_FIX_MODES", get("HANDOFF_FIX_MODES"), true)?,
            required_env: get("HANDOFF_REQUIRE_ENV")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            no_new_privs: parse_bool("HANDOFF_NO_NEW_PRIVS", get("HANDOFF_NO_NEW_PRIVS"), false)?,
            app_module: get("HANDOFF_APP_MODULE").unwrap_or_else(|| DEFAULT_APP_MODULE.to_string()),
            listen: ListenAddr::from_lookup(&lookup)?,
            // Presence alone turns debug on, whatever the value
            debug: lookup("DEBUG").is_some(),
            metrics_file: get("HANDOFF_METRICS_FILE").map(PathBuf::from),
            log_format,
        })
    }

    /// Every path ownership normalization walks, root first
    pub fn ownership_targets(&self) -> Vec<PathBuf> {
        let mut targets = vec![self.app_root.clone()];
        for path in &self.extra_paths {
            if !targets.contains(path) {
                targets.push(path.clone());
            }
        }
        targets
    }

    /// The dashboard server command used when none is given explicitly
    pub fn default_command(&self) -> Vec<String> {
        let mut cmd = vec![
            "gunicorn".to_string(),
            "--bind".to_string(),
            self.listen.bind_string(),
        ];
        if self.debug {
            cmd.extend(["--reload", "--log-level", "debug"].map(String::from));
        }
        cmd.push(self.app_module.clone());
        cmd
    }
}

fn parse_bool(var: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(var, format!("{:?} is not a boolean", other))),
    }
}

fn parse_path_list(raw: &str) -> Result<Vec<PathBuf>, ConfigError> {
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let path = PathBuf::from(s);
            if path.is_absolute() {
                Ok(path)
            } else {
                Err(ConfigError::invalid(
                    "HANDOFF_CHOWN_PATHS",
                    format!("{:?} must be an absolute path", s),
                ))
            }
        })
        .collect()
}
