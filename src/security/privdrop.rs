//! setgroups → setgid → setuid, then prove it stuck
//!
//! The syscalls sit behind the [`Credentials`] trait so the ordering and
//! the fail-closed behaviour can be exercised without root. Production
//! code uses [`SystemCredentials`].

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};
use thiserror::Error;

use super::capabilities::{self, CapabilityReset};
use crate::identity::ServiceIdentity;

#[derive(Debug, Error)]
pub enum DropError {
    #[error("must start as root to drop privileges (euid {euid})")]
    NotPrivileged { euid: u32 },

    #[error("{call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: Errno,
    },

    #[error("credentials not dropped: {0}")]
    Verification(String),

    #[error("{0} could be set back to 0 after the drop")]
    RegainedRoot(&'static str),

    #[error("capabilities retained after the drop: {}", .0.join(","))]
    CapabilitiesRetained(Vec<String>),

    #[error("reading capability sets: {0}")]
    Capabilities(String),
}

fn syscall(call: &'static str) -> impl FnOnce(Errno) -> DropError {
    move |source| DropError::Syscall { call, source }
}

/// Knobs for the drop
#[derive(Debug, Clone, Copy, Default)]
pub struct DropOptions {
    /// Set PR_SET_NO_NEW_PRIVS so setuid binaries cannot elevate later
    pub no_new_privs: bool,
}

/// What happened during a successful drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropReport {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub capabilities: CapabilityReset,
    pub no_new_privs: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Credentials
// ═══════════════════════════════════════════════════════════════════════════
// The handful of process-credential operations the drop needs. Each
// returns the raw errno so callers can report which call failed.
// ═══════════════════════════════════════════════════════════════════════════

pub trait Credentials {
    fn euid(&self) -> u32;
    fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno>;
    fn set_gid(&mut self, gid: u32) -> Result<(), Errno>;
    fn set_uid(&mut self, uid: u32) -> Result<(), Errno>;
    /// (real, effective, saved)
    fn res_uid(&self) -> Result<(u32, u32, u32), Errno>;
    /// (real, effective, saved)
    fn res_gid(&self) -> Result<(u32, u32, u32), Errno>;
    fn groups(&self) -> Result<Vec<u32>, Errno>;
    fn reset_capability_sets(&mut self) -> CapabilityReset;
    fn retained_capabilities(&self) -> Result<Vec<String>, String>;
    fn set_no_new_privs(&mut self) -> Result<(), Errno>;
}

/// The real process credentials
#[derive(Debug, Default)]
pub struct SystemCredentials;

impl Credentials for SystemCredentials {
    fn euid(&self) -> u32 {
        unistd::geteuid().as_raw()
    }

    fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno> {
        let gids: Vec<Gid> = groups.iter().copied().map(Gid::from_raw).collect();
        unistd::setgroups(&gids)
    }

    fn set_gid(&mut self, gid: u32) -> Result<(), Errno> {
        unistd::setgid(Gid::from_raw(gid))
    }

    fn set_uid(&mut self, uid: u32) -> Result<(), Errno> {
        unistd::setuid(Uid::from_raw(uid))
    }

    fn res_uid(&self) -> Result<(u32, u32, u32), Errno> {
        let ids = unistd::getresuid()?;
        Ok((ids.real.as_raw(), ids.effective.as_raw(), ids.saved.as_raw()))
    }

    fn res_gid(&self) -> Result<(u32, u32, u32), Errno> {
        let ids = unistd::getresgid()?;
        Ok((ids.real.as_raw(), ids.effective.as_raw(), ids.saved.as_raw()))
    }

    fn groups(&self) -> Result<Vec<u32>, Errno> {
        Ok(unistd::getgroups()?.into_iter().map(Gid::as_raw).collect())
    }

    fn reset_capability_sets(&mut self) -> CapabilityReset {
        CapabilityReset::apply()
    }

    fn retained_capabilities(&self) -> Result<Vec<String>, String> {
        capabilities::retained().map_err(|e| e.to_string())
    }

    fn set_no_new_privs(&mut self) -> Result<(), Errno> {
        // SAFETY: prctl with PR_SET_NO_NEW_PRIVS takes only integer
        // arguments and touches no memory we own.
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }
}

/// Drop the real process credentials to `identity`
pub fn drop_privileges(
    identity: &ServiceIdentity,
    options: &DropOptions,
) -> Result<DropReport, DropError> {
    drop_with(&mut SystemCredentials, identity, options)
}

// ═══════════════════════════════════════════════════════════════════════════
// drop_with() - The ordered drop sequence
// ═══════════════════════════════════════════════════════════════════════════
// ORDER (never rearrange):
//   1. check euid == 0
//   2. clear bounding/inheritable/ambient capability sets (best effort)
//   3. setgroups(identity.groups)
//   4. setgid(identity.gid)
//   5. setuid(identity.uid)
//   6. verify ids, groups, capabilities, and that root cannot come back
//   7. PR_SET_NO_NEW_PRIVS (optional)
//
// The first error returns immediately; later steps never run.
// ═══════════════════════════════════════════════════════════════════════════
pub fn drop_with<C: Credentials>(
    creds: &mut C,
    identity: &ServiceIdentity,
    options: &DropOptions,
) -> Result<DropReport, DropError> {
    let euid = creds.euid();
    if euid != 0 {
        return Err(DropError::NotPrivileged { euid });
    }
    if identity.uid == 0 || identity.gid == 0 || identity.groups.contains(&0) {
        return Err(DropError::Verification(format!(
            "target {} keeps uid or gid 0",
            identity.name
        )));
    }

    let reset = creds.reset_capability_sets();
    if !reset.is_complete() {
        tracing::warn!(
            bounding_failed = ?reset.bounding_failed,
            inheritable_cleared = reset.inheritable_cleared,
            ambient_cleared = reset.ambient_cleared,
            "could not fully clear exec-time capability sets"
        );
    }

    creds.set_groups(&identity.groups).map_err(syscall("setgroups"))?;
    creds.set_gid(identity.gid).map_err(syscall("setgid"))?;
    creds.set_uid(identity.uid).map_err(syscall("setuid"))?;

    verify(creds, identity)?;

    if options.no_new_privs {
        creds
            .set_no_new_privs()
            .map_err(syscall("prctl(PR_SET_NO_NEW_PRIVS)"))?;
    }

    tracing::debug!(
        uid = identity.uid,
        gid = identity.gid,
        groups = ?identity.groups,
        "privileges dropped"
    );

    Ok(DropReport {
        uid: identity.uid,
        gid: identity.gid,
        groups: identity.groups.clone(),
        capabilities: reset,
        no_new_privs: options.no_new_privs,
    })
}

fn verify<C: Credentials>(creds: &mut C, identity: &ServiceIdentity) -> Result<(), DropError> {
    let uids = creds.res_uid().map_err(syscall("getresuid"))?;
    let want = (identity.uid, identity.uid, identity.uid);
    if uids != want {
        return Err(DropError::Verification(format!(
            "uids (real, effective, saved) are {:?}, expected {:?}",
            uids, want
        )));
    }

    let gids = creds.res_gid().map_err(syscall("getresgid"))?;
    let want = (identity.gid, identity.gid, identity.gid);
    if gids != want {
        return Err(DropError::Verification(format!(
            "gids (real, effective, saved) are {:?}, expected {:?}",
            gids, want
        )));
    }

    let mut groups = creds.groups().map_err(syscall("getgroups"))?;
    if groups.contains(&0) {
        return Err(DropError::Verification(
            "supplementary group 0 still held".to_string(),
        ));
    }
    groups.sort_unstable();
    groups.dedup();
    let mut expected = identity.groups.clone();
    expected.sort_unstable();
    expected.dedup();
    if groups != expected {
        return Err(DropError::Verification(format!(
            "supplementary groups are {:?}, expected {:?}",
            groups, expected
        )));
    }

    let retained = creds
        .retained_capabilities()
        .map_err(DropError::Capabilities)?;
    if !retained.is_empty() {
        return Err(DropError::CapabilitiesRetained(retained));
    }

    // Both must fail with EPERM now
    if creds.set_gid(0).is_ok() {
        return Err(DropError::RegainedRoot("gid"));
    }
    if creds.set_uid(0).is_ok() {
        return Err(DropError::RegainedRoot("uid"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulates the kernel rules that matter for ordering: once the uid
    /// is non-zero, group and uid changes need privilege we no longer have.
    #[derive(Default)]
    struct FakeKernel {
        uid: u32,
        gid: u32,
        groups: Vec<u32>,
        calls: Vec<&'static str>,
        fail_setgid: bool,
        keep_saved_uid: bool,
        leak_caps: bool,
        allow_regain: bool,
        keep_root_group: bool,
    }

    impl Credentials for FakeKernel {
        fn euid(&self) -> u32 {
            self.uid
        }

        fn set_groups(&mut self, groups: &[u32]) -> Result<(), Errno> {
            self.calls.push("setgroups");
            if self.uid != 0 {
                return Err(Errno::EPERM);
            }
            self.groups = groups.to_vec();
            if self.keep_root_group {
                self.groups.push(0);
            }
            Ok(())
        }

        fn set_gid(&mut self, gid: u32) -> Result<(), Errno> {
            self.calls.push("setgid");
            if self.fail_setgid || (self.uid != 0 && !self.allow_regain) {
                return Err(Errno::EPERM);
            }
            self.gid = gid;
            Ok(())
        }

        fn set_uid(&mut self, uid: u32) -> Result<(), Errno> {
            self.calls.push("setuid");
            if self.uid != 0 && !self.allow_regain {
                return Err(Errno::EPERM);
            }
            self.uid = uid;
            Ok(())
        }

        fn res_uid(&self) -> Result<(u32, u32, u32), Errno> {
            let saved = if self.keep_saved_uid { 0 } else { self.uid };
            Ok((self.uid, self.uid, saved))
        }

        fn res_gid(&self) -> Result<(u32, u32, u32), Errno> {
            Ok((self.gid, self.gid, self.gid))
        }

        fn groups(&self) -> Result<Vec<u32>, Errno> {
            Ok(self.groups.clone())
        }

        fn reset_capability_sets(&mut self) -> CapabilityReset {
            self.calls.push("caps");
            CapabilityReset {
                bounding_dropped: 41,
                inheritable_cleared: true,
                ambient_cleared: true,
                ..Default::default()
            }
        }

        fn retained_capabilities(&self) -> Result<Vec<String>, String> {
            if self.leak_caps {
                Ok(vec!["CAP_NET_BIND_SERVICE".into()])
            } else {
                Ok(Vec::new())
            }
        }

        fn set_no_new_privs(&mut self) -> Result<(), Errno> {
            self.calls.push("no_new_privs");
            Ok(())
        }
    }

    fn app() -> ServiceIdentity {
        ServiceIdentity {
            name: "app".into(),
            uid: 1000,
            gid: 1000,
            home: "/home/app".into(),
            groups: vec![1000, 27],
        }
    }

    #[test]
    fn test_drop_order() {
        let mut kernel = FakeKernel::default();
        let report = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap();

        assert_eq!(
            &kernel.calls[..4],
            &["caps", "setgroups", "setgid", "setuid"]
        );
        assert_eq!((kernel.uid, kernel.gid), (1000, 1000));
        assert_eq!(report.groups, vec![1000, 27]);
        assert!(!report.no_new_privs);
    }

    #[test]
    fn test_regain_attempts_are_made_and_fail() {
        let mut kernel = FakeKernel::default();
        drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap();
        // verification tries setgid(0) and setuid(0) after the real drop
        assert_eq!(&kernel.calls[4..], &["setgid", "setuid"]);
        assert_eq!(kernel.uid, 1000);
    }

    #[test]
    fn test_requires_root() {
        let mut kernel = FakeKernel {
            uid: 1000,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::NotPrivileged { euid: 1000 }));
        assert!(kernel.calls.is_empty());
    }

    #[test]
    fn test_setgid_failure_stops_before_setuid() {
        let mut kernel = FakeKernel {
            fail_setgid: true,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::Syscall { call: "setgid", .. }));
        assert!(!kernel.calls.contains(&"setuid"));
        assert_eq!(kernel.uid, 0);
    }

    #[test]
    fn test_saved_uid_left_behind_is_caught() {
        let mut kernel = FakeKernel {
            keep_saved_uid: true,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::Verification(_)));
    }

    #[test]
    fn test_root_group_target_refused_before_any_change() {
        let mut kernel = FakeKernel::default();
        let mut identity = app();
        identity.groups.push(0);
        let err = drop_with(&mut kernel, &identity, &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::Verification(_)));
        assert!(kernel.calls.is_empty());
    }

    #[test]
    fn test_root_group_left_behind_is_caught() {
        let mut kernel = FakeKernel {
            keep_root_group: true,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::Verification(msg) if msg.contains("group 0")));
    }

    #[test]
    fn test_regained_root_is_caught() {
        let mut kernel = FakeKernel {
            allow_regain: true,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        assert!(matches!(err, DropError::RegainedRoot("gid")));
    }

    #[test]
    fn test_retained_capabilities_are_caught() {
        let mut kernel = FakeKernel {
            leak_caps: true,
            ..Default::default()
        };
        let err = drop_with(&mut kernel, &app(), &DropOptions::default()).unwrap_err();
        match err {
            DropError::CapabilitiesRetained(caps) => {
                assert_eq!(caps, vec!["CAP_NET_BIND_SERVICE".to_string()])
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_no_new_privs_after_verification() {
        let mut kernel = FakeKernel::default();
        let options = DropOptions { no_new_privs: true };
        let report = drop_with(&mut kernel, &app(), &options).unwrap();
        assert!(report.no_new_privs);
        assert_eq!(kernel.calls.last(), Some(&"no_new_privs"));
    }
}
