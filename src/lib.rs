//! handoff - privilege-dropping container entrypoint for the dashboard image
//!
//! The container starts as root only so it can fix up the ownership of
//! the application tree and mounted volumes. It then becomes the
//! unprivileged service account for good and replaces itself with the
//! dashboard server, keeping the pid so signals arrive directly.
//!
//! # Modules
//!
//! - `config` - environment-only configuration
//! - `identity` - service account and group resolution
//! - `ownership` - recursive, symlink-safe ownership normalization
//! - `security` - irreversible privilege drop and its verification
//! - `launch` - environment construction and exec
//! - `bootstrap` - the ordered entrypoint sequence
//! - `layers` - Dockerfile dependency-layer ordering check
//! - `probe` - readiness probe for HEALTHCHECK
//! - `metrics` - Prometheus textfile metrics
//! - `telemetry` - tracing subscriber setup
//!
//! # Quick Start
//!
//! ```ignore
//! use handoff::{bootstrap, BootConfig};
//!
//! let config = BootConfig::from_env()?;
//! // Only returns on failure
//! let err = bootstrap::run(&config, Vec::new()).unwrap_err();
//! std::process::exit(err.exit_code());
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod identity;
pub mod launch;
pub mod layers;
pub mod metrics;
pub mod ownership;
pub mod probe;
pub mod security;
pub mod telemetry;

pub use config::{BootConfig, ListenAddr, LogFormat};
pub use error::BootError;
pub use identity::{IdentitySpec, ServiceIdentity};
pub use security::drop_privileges;
