//! Recursive `lchown` walk
//!
//! Symlinks are never followed: the link itself is re-owned with
//! `lchown(2)` and the walk does not descend through it. A link inside
//! the application root pointing at `/etc` must not hand `/etc` to the
//! service account.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::identity::ServiceIdentity;

#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("application root {} does not exist", .0.display())]
    MissingRoot(PathBuf),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> OwnershipError + 'a {
    move |source| OwnershipError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Target owner and mode rules for the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipPolicy {
    pub uid: u32,
    pub gid: u32,
    /// Ensure `u+rw` on files and `u+rwx` on directories
    pub fix_modes: bool,
}

impl OwnershipPolicy {
    pub fn for_identity(identity: &ServiceIdentity, fix_modes: bool) -> Self {
        Self {
            uid: identity.uid,
            gid: identity.gid,
            fix_modes,
        }
    }

    /// Mode an entry should have, or None when it is already fine
    fn wanted_mode(&self, current: u32, is_dir: bool) -> Option<u32> {
        if !self.fix_modes {
            return None;
        }
        let current = current & 0o7777;
        let wanted = current | if is_dir { 0o700 } else { 0o600 };
        (wanted != current).then_some(wanted)
    }
}

/// Counters from one normalization pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipReport {
    /// Entries visited (including the roots)
    pub scanned: u64,
    /// Entries whose owner or group was changed
    pub chowned: u64,
    /// Entries whose mode was changed
    pub chmodded: u64,
    /// Symlinks re-owned without following
    pub symlinks: u64,
    /// Optional roots that did not exist
    pub missing: Vec<PathBuf>,
}

impl OwnershipReport {
    fn merge(&mut self, other: OwnershipReport) {
        self.scanned += other.scanned;
        self.chowned += other.chowned;
        self.chmodded += other.chmodded;
        self.symlinks += other.symlinks;
        self.missing.extend(other.missing);
    }

    /// True when the pass made no changes at all
    pub fn is_clean(&self) -> bool {
        self.chowned == 0 && self.chmodded == 0
    }
}

/// Normalize the application root (required) and extra paths (optional)
///
/// A missing root is fatal. A missing extra path is recorded in
/// [`OwnershipReport::missing`] and skipped.
pub fn normalize(
    root: &Path,
    extra: &[PathBuf],
    policy: &OwnershipPolicy,
) -> Result<OwnershipReport, OwnershipError> {
    let mut report = normalize_tree(root, policy)?;

    for path in extra.iter().filter(|p| p.as_path() != root) {
        match normalize_tree(path, policy) {
            Ok(sub) => report.merge(sub),
            Err(OwnershipError::MissingRoot(missing)) => {
                tracing::warn!(
                    path = %missing.display(),
                    "extra ownership path does not exist, skipping"
                );
                report.missing.push(missing);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

/// Normalize a single tree rooted at `root`
pub fn normalize_tree(
    root: &Path,
    policy: &OwnershipPolicy,
) -> Result<OwnershipReport, OwnershipError> {
    let mut report = OwnershipReport::default();

    let root_meta = match fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(OwnershipError::MissingRoot(root.to_path_buf()))
        }
        Err(e) => return Err(io_err("stat", root)(e)),
    };

    // Iterative: depth is bounded only by the tree, not our stack
    let mut pending: Vec<(PathBuf, Metadata)> = vec![(root.to_path_buf(), root_meta)];

    while let Some((path, meta)) = pending.pop() {
        fix_entry(&path, &meta, policy, &mut report)?;

        if !meta.is_dir() {
            continue;
        }

        let entries = fs::read_dir(&path).map_err(io_err("read_dir", &path))?;
        for entry in entries {
            let entry = entry.map_err(io_err("read_dir", &path))?;
            let child = entry.path();
            match fs::symlink_metadata(&child) {
                Ok(child_meta) => pending.push((child, child_meta)),
                // Removed between readdir and lstat: nothing left to own
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("stat", &child)(e)),
            }
        }
    }

    Ok(report)
}

fn fix_entry(
    path: &Path,
    meta: &Metadata,
    policy: &OwnershipPolicy,
    report: &mut OwnershipReport,
) -> Result<(), OwnershipError> {
    report.scanned += 1;

    let mut mode = meta.mode();

    if meta.uid() != policy.uid || meta.gid() != policy.gid {
        lchown(path, Some(policy.uid), Some(policy.gid)).map_err(io_err("lchown", path))?;
        report.chowned += 1;
        if meta.file_type().is_symlink() {
            report.symlinks += 1;
        }
        tracing::trace!(path = %path.display(), uid = policy.uid, gid = policy.gid, "chowned");

        // chown(2) by root clears set-id bits on regular files
        if !meta.file_type().is_symlink() {
            mode = fs::symlink_metadata(path).map_err(io_err("stat", path))?.mode();
        }
    }

    if meta.file_type().is_symlink() {
        return Ok(());
    }

    if let Some(wanted) = policy.wanted_mode(mode, meta.is_dir()) {
        fs::set_permissions(path, fs::Permissions::from_mode(wanted))
            .map_err(io_err("chmod", path))?;
        report.chmodded += 1;
        tracing::trace!(path = %path.display(), mode = %format!("{:o}", wanted), "chmodded");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_policy(fix_modes: bool) -> OwnershipPolicy {
        OwnershipPolicy {
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            fix_modes,
        }
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = normalize_tree(&missing, &current_policy(false)).unwrap_err();
        assert!(matches!(err, OwnershipError::MissingRoot(p) if p == missing));
    }

    #[test]
    fn test_stat_error_names_op_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "x").unwrap();
        let below_file = file.join("x");

        match normalize_tree(&below_file, &current_policy(false)) {
            Err(OwnershipError::Io { op, path, .. }) => {
                assert_eq!(op, "stat");
                assert_eq!(path, below_file);
            }
            other => panic!("expected stat error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_extra_path_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let extra = vec![dir.path().join("volume")];
        let report = normalize(dir.path(), &extra, &current_policy(false)).unwrap();
        assert_eq!(report.missing, extra);
        assert_eq!(report.scanned, 1);
    }

    #[test]
    fn test_wanted_mode() {
        let policy = current_policy(true);
        assert_eq!(policy.wanted_mode(0o100044, false), Some(0o644));
        assert_eq!(policy.wanted_mode(0o100640, false), None);
        assert_eq!(policy.wanted_mode(0o040555, true), Some(0o755));
        assert_eq!(policy.wanted_mode(0o104555, false), Some(0o4755));
        assert_eq!(current_policy(false).wanted_mode(0o000, false), None);
    }

    #[test]
    fn test_report_merge() {
        let mut a = OwnershipReport {
            scanned: 2,
            chowned: 1,
            ..Default::default()
        };
        a.merge(OwnershipReport {
            scanned: 3,
            chmodded: 1,
            missing: vec![PathBuf::from("/x")],
            ..Default::default()
        });
        assert_eq!(a.scanned, 5);
        assert_eq!(a.chowned, 1);
        assert_eq!(a.chmodded, 1);
        assert!(!a.is_clean());
        assert_eq!(a.missing.len(), 1);
    }
}
