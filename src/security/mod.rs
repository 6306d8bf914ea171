//! Privilege drop for the container entrypoint
//!
//! The entrypoint starts as root so it can fix ownership of the
//! application tree. Before the dashboard runs, that power has to go,
//! permanently:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 1: CAPABILITY SETS (best effort, needs CAP_SETPCAP)      │
//! │  Clear bounding, inheritable and ambient sets so nothing can    │
//! │  be regained through a file capability after exec               │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 2: CREDENTIALS (strict order)                            │
//! │                                                                 │
//! │  setgroups(app groups) ──► setgid(app) ──► setuid(app)          │
//! │                                                                 │
//! │  Group changes need CAP_SETGID, which setuid() takes away.      │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Layer 3: VERIFY                                                │
//! │  real/effective/saved ids, group list, empty capability sets,  │
//! │  setuid(0) and setgid(0) must both fail                         │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                         exec(app)
//! ```
//!
//! Any failure aborts the process. There is no fallback that runs the
//! application with the original credentials.

pub mod capabilities;
pub mod privdrop;

pub use capabilities::{describe_current_caps, CapabilityReset};
pub use privdrop::{
    drop_privileges, drop_with, Credentials, DropError, DropOptions, DropReport,
    SystemCredentials,
};
