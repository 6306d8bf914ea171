//! The container entrypoint sequence
//!
//! ```text
//! container start
//!      │
//!      ▼
//! ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌──────────┐  ┌─────────┐
//! │ config + │─►│ identity │─►│ ownership │─►│   drop   │─►│  exec   │
//! │ env check│  │ resolve  │  │ normalize │  │ gid, uid │  │  (app)  │
//! └──────────┘  └──────────┘  └───────────┘  └──────────┘  └─────────┘
//!      │              │              │              │             │
//!      └──────────────┴──────────────┴──────────────┴─────────────┘
//!                          any error: exit non-zero
//! ```
//!
//! Runs once, single-threaded, still as root until the drop step.
//! Nothing is retried; a crash anywhere means the container restarts
//! from the top, which is safe because every step is idempotent.

pub mod plan;

use std::convert::Infallible;
use std::ffi::OsString;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::BootConfig;
use crate::error::BootError;
use crate::metrics;
use crate::ownership;
use crate::security;

pub use plan::{check_required_env, BootPlan, BOOT_ID_VAR};

/// Run the whole bootstrap. Returns only on failure.
pub fn run(config: &BootConfig, command: Vec<OsString>) -> Result<Infallible, BootError> {
    let boot_id = crate::telemetry::new_boot_id();
    let span = tracing::info_span!("boot", boot_id = %boot_id);
    let _enter = span.enter();

    let plan = metrics::observe_step("identity", || {
        BootPlan::resolve(config, command, std::env::vars_os(), boot_id.clone())
    })?;

    tracing::info!(
        user = %plan.identity.name,
        uid = plan.identity.uid,
        gid = plan.identity.gid,
        app_root = %plan.app_root.display(),
        "resolved service identity"
    );

    match &plan.ownership {
        Some(policy) => {
            let report = metrics::observe_step("ownership", || {
                ownership::normalize(&plan.app_root, &plan.extra_paths, policy)
            })?;

            metrics::OWNERSHIP_SCANNED.inc_by(report.scanned);
            metrics::OWNERSHIP_CHANGED
                .with_label_values(&["owner"])
                .inc_by(report.chowned);
            metrics::OWNERSHIP_CHANGED
                .with_label_values(&["mode"])
                .inc_by(report.chmodded);

            tracing::info!(
                scanned = report.scanned,
                chowned = report.chowned,
                chmodded = report.chmodded,
                symlinks = report.symlinks,
                clean = report.is_clean(),
                "ownership normalized"
            );
        }
        None => tracing::info!("ownership normalization skipped"),
    }

    // Last chance to write as root; the service account may not be able
    // to write the metrics directory.
    flush_metrics(config);

    let dropped = metrics::observe_step("drop", || {
        security::drop_privileges(&plan.identity, &plan.drop)
    })?;

    tracing::info!(
        uid = dropped.uid,
        gid = dropped.gid,
        bounding_dropped = dropped.capabilities.bounding_dropped,
        no_new_privs = dropped.no_new_privs,
        caps = %security::describe_current_caps(),
        argv = ?plan.launch.summary().argv,
        "handing off"
    );

    Err(plan.launch.exec().into())
}

/// Record a fatal error in metrics and flush them, best effort
pub fn record_failure(config: Option<&BootConfig>, err: &BootError) {
    metrics::BOOT_FAILURES
        .with_label_values(&[err.stage()])
        .inc();
    tracing::error!(stage = err.stage(), exit_code = err.exit_code(), error = %err, "bootstrap failed");
    if let Some(config) = config {
        flush_metrics(config);
    }
}

fn flush_metrics(config: &BootConfig) {
    let Some(path) = &config.metrics_file else {
        return;
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    metrics::BOOT_COMPLETED.set(now);

    if let Err(e) = metrics::write_textfile(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not write metrics textfile");
    }
}
