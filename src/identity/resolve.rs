//! `USER[:GROUP]` parsing and account database lookups
//!
//! ```text
//! "app"          → user by name, primary group from passwd
//! "app:www"      → user by name, group by name
//! "1000:1000"    → numeric ids, passwd entry optional
//! "1000"         → numeric uid, must exist in passwd (no implicit gid)
//! ```

use std::ffi::CString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use nix::unistd::{getgrouplist, Gid, Group, Uid, User};
use serde::Serialize;
use thiserror::Error;

/// Errors from parsing or resolving an identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid identity {0:?}: expected USER[:GROUP]")]
    Invalid(String),

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("unknown group {0:?}")]
    UnknownGroup(String),

    #[error("uid {0} has no passwd entry; a group must be given explicitly")]
    MissingGroup(u32),

    #[error("refusing to run as root ({0})")]
    RootTarget(String),

    #[error("account database lookup failed: {0}")]
    Lookup(#[from] nix::Error),
}

/// One side of a `USER[:GROUP]` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Name(String),
    Id(u32),
}

impl Principal {
    fn parse(raw: &str, whole: &str) -> Result<Self, IdentityError> {
        if raw.is_empty() {
            return Err(IdentityError::Invalid(whole.to_string()));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw
                .parse()
                .map(Principal::Id)
                .map_err(|_| IdentityError::Invalid(whole.to_string()));
        }
        if raw.contains(|c: char| c.is_whitespace() || c == '\0' || c == ':') {
            return Err(IdentityError::Invalid(whole.to_string()));
        }
        Ok(Principal::Name(raw.to_string()))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Name(name) => f.write_str(name),
            Principal::Id(id) => write!(f, "{}", id),
        }
    }
}

/// A parsed, unresolved `USER[:GROUP]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySpec {
    pub user: Principal,
    pub group: Option<Principal>,
}

impl FromStr for IdentitySpec {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (user, group) = match s.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (s, None),
        };

        Ok(Self {
            user: Principal::parse(user, s)?,
            group: group.map(|g| Principal::parse(g, s)).transpose()?,
        })
    }
}

impl fmt::Display for IdentitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}:{}", self.user, group),
            None => write!(f, "{}", self.user),
        }
    }
}

/// The fully resolved account the application runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceIdentity {
    /// Account name, or the numeric uid when there is no passwd entry
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    /// Supplementary groups, always including `gid`
    pub groups: Vec<u32>,
}

/// Resolve a `USER[:GROUP]` pair against the account database
pub fn resolve(spec: &IdentitySpec) -> Result<ServiceIdentity, IdentityError> {
    let user = match &spec.user {
        Principal::Name(name) => Some(
            User::from_name(name)?.ok_or_else(|| IdentityError::UnknownUser(name.clone()))?,
        ),
        Principal::Id(uid) => User::from_uid(Uid::from_raw(*uid))?,
    };

    let uid = match (&user, &spec.user) {
        (Some(u), _) => u.uid.as_raw(),
        (None, Principal::Id(uid)) => *uid,
        (None, Principal::Name(name)) => return Err(IdentityError::UnknownUser(name.clone())),
    };

    let gid = match &spec.group {
        Some(Principal::Name(name)) => Group::from_name(name)?
            .ok_or_else(|| IdentityError::UnknownGroup(name.clone()))?
            .gid
            .as_raw(),
        Some(Principal::Id(gid)) => *gid,
        None => match &user {
            Some(u) => u.gid.as_raw(),
            None => return Err(IdentityError::MissingGroup(uid)),
        },
    };

    if uid == 0 {
        return Err(IdentityError::RootTarget(format!("uid 0 from {}", spec)));
    }
    if gid == 0 {
        return Err(IdentityError::RootTarget(format!("gid 0 from {}", spec)));
    }

    let groups = match &user {
        Some(u) => {
            let cname = CString::new(u.name.as_str())
                .map_err(|_| IdentityError::Invalid(u.name.clone()))?;
            let listed = getgrouplist(&cname, Gid::from_raw(gid))?;
            normalize_groups(gid, listed.into_iter().map(Gid::as_raw))
        }
        None => vec![gid],
    };

    let name = user
        .as_ref()
        .map(|u| u.name.clone())
        .unwrap_or_else(|| uid.to_string());
    reject_root_group(&name, &groups)?;

    Ok(ServiceIdentity {
        name,
        uid,
        gid,
        home: user
            .map(|u| u.dir)
            .unwrap_or_else(|| PathBuf::from("/")),
        groups,
    })
}

/// Membership in group 0 would survive the drop as a supplementary group
fn reject_root_group(name: &str, groups: &[u32]) -> Result<(), IdentityError> {
    if groups.contains(&0) {
        return Err(IdentityError::RootTarget(format!(
            "{} is a member of group 0",
            name
        )));
    }
    Ok(())
}

/// Primary gid first, then the rest in order, without duplicates
fn normalize_groups(primary: u32, listed: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut groups = vec![primary];
    for gid in listed {
        if !groups.contains(&gid) {
            groups.push(gid);
        }
    }
    groups
}
