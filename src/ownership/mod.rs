//! Ownership normalization for the application tree
//!
//! Files copied into the image, and volumes mounted at run time, can be
//! owned by whoever built or created them. Before the dashboard starts,
//! every entry under the application root must belong to the service
//! identity, otherwise the unprivileged process cannot write its caches
//! or session files.
//!
//! ```text
//! /app                 root:root  ──lchown──►  app:app
//! ├── requirements.txt root:root  ──lchown──►  app:app
//! ├── app/             1000:1000  ──lchown──►  app:app
//! │   └── main.py      app:app    (unchanged)
//! └── static -> /srv   symlink: link itself is chowned, target untouched
//! ```
//!
//! The walk is idempotent: entries that already have the right owner
//! (and mode) are counted but never touched, so a container restart on
//! a correct tree performs no writes.

pub mod walker;

pub use walker::{normalize, normalize_tree, OwnershipError, OwnershipPolicy, OwnershipReport};
