//! Service identity resolution
//!
//! The dashboard runs as one fixed, non-root account created when the
//! image is built. This module turns the `USER[:GROUP]` string from the
//! environment (or the `drop-privs` command line) into a fully resolved
//! [`ServiceIdentity`]: uid, primary gid, home directory and the
//! supplementary group list.
//!
//! # Example Usage
//!
//! ```ignore
//! use handoff::identity::{IdentitySpec, resolve};
//!
//! let spec: IdentitySpec = "app:app".parse()?;
//! let identity = resolve(&spec)?;
//! assert_ne!(identity.uid, 0);
//! ```
//!
//! The resolved value is immutable and passed explicitly to the
//! ownership and privilege-drop steps.

pub mod resolve;

pub use resolve::{resolve, IdentityError, IdentitySpec, Principal, ServiceIdentity};
