//! Prometheus metrics for the bootstrap
//!
//! The entrypoint execs away before anything could scrape it, so the
//! registry is rendered once into a node-exporter textfile
//! (`HANDOFF_METRICS_FILE`) right before the handoff, or right before a
//! fatal exit.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Wall time of each bootstrap step.
    ///
    /// Labels:
    /// - step: "identity", "ownership", "drop"
    pub static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "handoff_step_duration_seconds",
        "Duration of each bootstrap step",
        &["step"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).expect("failed to register STEP_DURATION metric");

    /// Entries visited by ownership normalization.
    pub static ref OWNERSHIP_SCANNED: IntCounter = register_int_counter!(
        "handoff_ownership_entries_scanned_total",
        "Entries visited by ownership normalization"
    ).expect("failed to register OWNERSHIP_SCANNED metric");

    /// Entries modified by ownership normalization.
    ///
    /// Labels:
    /// - change: "owner" or "mode"
    pub static ref OWNERSHIP_CHANGED: IntCounterVec = register_int_counter_vec!(
        "handoff_ownership_entries_changed_total",
        "Entries modified by ownership normalization",
        &["change"]
    ).expect("failed to register OWNERSHIP_CHANGED metric");

    /// Fatal bootstrap failures.
    ///
    /// Labels:
    /// - stage: see BootError::stage
    pub static ref BOOT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "handoff_boot_failures_total",
        "Fatal bootstrap failures by stage",
        &["stage"]
    ).expect("failed to register BOOT_FAILURES metric");

    /// Unix time the last bootstrap reached its outcome.
    pub static ref BOOT_COMPLETED: Gauge = register_gauge!(
        "handoff_boot_completed_timestamp_seconds",
        "Unix time the bootstrap handed off or failed"
    ).expect("failed to register BOOT_COMPLETED metric");
}

/// Run `f` and record its duration under `step`
pub fn observe_step<T>(step: &str, f: impl FnOnce() -> T) -> T {
    let timer = STEP_DURATION.with_label_values(&[step]).start_timer();
    let out = f();
    timer.observe_duration();
    out
}

/// Render the default registry in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Write the rendered registry to `path` atomically (tmp file + rename)
pub fn write_textfile(path: &Path) -> io::Result<()> {
    let body = render().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    // The textfile directory may be shared; never write through a planted link
    match fs::remove_file(tmp) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW)
        .open(tmp)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_step_records_sample() {
        let before = STEP_DURATION.with_label_values(&["unit-test"]).get_sample_count();
        let value = observe_step("unit-test", || 41 + 1);
        assert_eq!(value, 42);
        let after = STEP_DURATION.with_label_values(&["unit-test"]).get_sample_count();
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_textfile_contains_metrics() {
        OWNERSHIP_SCANNED.inc_by(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.prom");
        write_textfile(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("handoff_ownership_entries_scanned_total"));
        assert!(!dir.path().join("handoff.prom.tmp").exists());
    }

    #[test]
    fn test_textfile_replaces_linked_tmp() {
        OWNERSHIP_SCANNED.inc();
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("shadow");
        fs::write(&victim, "IMPORTANT").unwrap();
        let path = dir.path().join("handoff.prom");
        std::os::unix::fs::symlink(&victim, dir.path().join("handoff.prom.tmp")).unwrap();

        write_textfile(&path).unwrap();

        assert_eq!(fs::read_to_string(&victim).unwrap(), "IMPORTANT");
        assert!(fs::read_to_string(&path).unwrap().contains("handoff_"));
        assert!(!fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
    }
}
