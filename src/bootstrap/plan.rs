//! Resolve configuration into a concrete, side-effect-free boot plan

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use serde_json::json;

use crate::config::{BootConfig, ENV_PREFIX};
use crate::error::BootError;
use crate::identity::{self, ServiceIdentity};
use crate::launch::{EnvBuilder, LaunchCommand};
use crate::ownership::OwnershipPolicy;
use crate::security::DropOptions;

/// Name of the variable carrying the boot id into the application
pub const BOOT_ID_VAR: &str = "HANDOFF_BOOT_ID";

/// Everything the bootstrap will do, resolved up front
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub boot_id: String,
    pub identity: ServiceIdentity,
    /// None when ownership normalization is skipped
    pub ownership: Option<OwnershipPolicy>,
    pub app_root: PathBuf,
    pub extra_paths: Vec<PathBuf>,
    pub drop: DropOptions,
    pub launch: LaunchCommand,
}

impl BootPlan {
    /// Resolve a plan from config, an explicit command (may be empty)
    /// and the inherited environment
    pub fn resolve<I>(
        config: &BootConfig,
        command: Vec<OsString>,
        inherited: I,
        boot_id: String,
    ) -> Result<Self, BootError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let inherited: BTreeMap<OsString, OsString> = inherited.into_iter().collect();
        check_required_env(&config.required_env, &inherited)?;

        let identity = identity::resolve(&config.user)?;

        let env = EnvBuilder::inherit(inherited)
            .strip_prefix(ENV_PREFIX)
            .identity(&identity)
            .set("HOST", &config.listen.host)
            .set("PORT", config.listen.port.to_string())
            .set(BOOT_ID_VAR, &boot_id)
            .build();

        let argv = if command.is_empty() {
            config.default_command().into_iter().map(OsString::from).collect()
        } else {
            command
        };

        let launch = LaunchCommand::from_argv(argv, env, Some(config.app_root.clone()))?;

        Ok(Self {
            boot_id,
            ownership: (!config.skip_chown)
                .then(|| OwnershipPolicy::for_identity(&identity, config.fix_modes)),
            identity,
            app_root: config.app_root.clone(),
            extra_paths: config.ownership_targets().into_iter().skip(1).collect(),
            drop: DropOptions {
                no_new_privs: config.no_new_privs,
            },
            launch,
        })
    }

    /// JSON rendering for `handoff plan`
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "boot_id": self.boot_id,
            "identity": self.identity,
            "ownership": {
                "enabled": self.ownership.is_some(),
                "fix_modes": self.ownership.map(|p| p.fix_modes).unwrap_or(false),
                "app_root": self.app_root,
                "extra_paths": self.extra_paths,
            },
            "no_new_privs": self.drop.no_new_privs,
            "launch": self.launch.summary(),
        })
    }
}

/// Fail when any required variable is absent
pub fn check_required_env(
    required: &[String],
    env: &BTreeMap<OsString, OsString>,
) -> Result<(), BootError> {
    match required
        .iter()
        .find(|name| !env.contains_key(OsStr::new(name.as_str())))
    {
        Some(missing) => Err(BootError::MissingEnv(missing.clone())),
        None => Ok(()),
    }
}
