//! End-to-end tests for the `handoff` and `drop-privs` binaries
//!
//! Tests that actually drop privileges need root and are marked
//! #[ignore]. The rest check that every failure path exits non-zero
//! before the target command runs.

use std::path::Path;
use std::process::{Command, Output};

use handoff::error::{EX_CONFIG, EX_NOPERM, EX_NOUSER, EX_USAGE};

const HANDOFF: &str = env!("CARGO_BIN_EXE_handoff");
const DROP_PRIVS: &str = env!("CARGO_BIN_EXE_drop-privs");

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn handoff(args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(HANDOFF);
    cmd.args(args);
    for key in ["HANDOFF_USER", "HANDOFF_REQUIRE_ENV", "SECRET_KEY", "RUST_LOG"] {
        cmd.env_remove(key);
    }
    cmd.envs(env.iter().copied());
    cmd.output().unwrap()
}

fn touch_command(marker: &Path) -> Vec<String> {
    vec!["touch".to_string(), marker.display().to_string()]
}

/// Test that a missing required variable aborts before anything runs
#[test]
fn test_missing_required_env() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let mut args = vec!["run", "--"];
    let touch = touch_command(&marker);
    args.extend(touch.iter().map(String::as_str));

    let out = handoff(&args, &[("HANDOFF_REQUIRE_ENV", "SECRET_KEY")]);

    assert_eq!(out.status.code(), Some(EX_CONFIG));
    assert!(!marker.exists());
    assert!(String::from_utf8_lossy(&out.stderr).contains("SECRET_KEY"));
}

/// Test that malformed configuration exits with the config code
#[test]
fn test_invalid_config() {
    let out = handoff(&["run", "--", "true"], &[("PORT", "not-a-port")]);
    assert_eq!(out.status.code(), Some(EX_CONFIG));
}

/// Test that an unknown account aborts before anything runs
#[test]
fn test_unknown_user() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let mut args = vec!["run", "--"];
    let touch = touch_command(&marker);
    args.extend(touch.iter().map(String::as_str));

    let out = handoff(&args, &[("HANDOFF_USER", "no-such-user-handoff")]);

    assert_eq!(out.status.code(), Some(EX_NOUSER));
    assert!(!marker.exists());
}

/// Test that `plan` resolves everything without side effects
#[test]
fn test_plan_prints_json() {
    let out = handoff(
        &["plan", "--", "python", "-m", "http.server"],
        &[
            ("HANDOFF_USER", "65534:65534"),
            ("HANDOFF_SKIP_CHOWN", "yes"),
            ("HANDOFF_CUSTOM", "hidden"),
            ("PORT", "9000"),
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(plan["identity"]["uid"], 65534);
    assert_eq!(plan["identity"]["gid"], 65534);
    assert_eq!(plan["ownership"]["enabled"], false);
    assert_eq!(
        plan["launch"]["argv"],
        serde_json::json!(["python", "-m", "http.server"])
    );
    assert_eq!(plan["launch"]["workdir"], "/app");

    let env = &plan["launch"]["env"];
    assert_eq!(env["PORT"], "9000");
    assert!(env.get("HANDOFF_CUSTOM").is_none());
    assert_eq!(env["HANDOFF_BOOT_ID"], plan["boot_id"]);
}

/// Test that `plan` never prints inherited secret values
#[test]
fn test_plan_redacts_secrets() {
    let out = handoff(
        &["plan", "--", "true"],
        &[
            ("HANDOFF_USER", "65534:65534"),
            ("HANDOFF_REQUIRE_ENV", "SECRET_KEY"),
            ("SECRET_KEY", "hunter2-do-not-print"),
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("hunter2-do-not-print"), "{}", stdout);
    assert!(!String::from_utf8_lossy(&out.stderr).contains("hunter2-do-not-print"));

    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(plan["launch"]["env"]["SECRET_KEY"], handoff::launch::REDACTED);
}

/// Test the default server command when none is given
#[test]
fn test_plan_default_command() {
    let out = handoff(
        &["plan"],
        &[("HANDOFF_USER", "65534:65534"), ("DEBUG", "")],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(
        plan["launch"]["argv"],
        serde_json::json!([
            "gunicorn",
            "--bind",
            "0.0.0.0:8050",
            "--reload",
            "--log-level",
            "debug",
            "app.main:app"
        ])
    );
}

/// Test that refusing to run as root is enforced through the CLI
#[test]
fn test_root_target_refused() {
    let out = handoff(&["plan"], &[("HANDOFF_USER", "root")]);
    assert_eq!(out.status.code(), Some(EX_NOUSER));
}

/// Test `check-layers` against the shipped Dockerfile and a bad one
#[test]
fn test_check_layers() {
    let shipped = Path::new(env!("CARGO_MANIFEST_DIR")).join("deploy/Dockerfile");
    let out = handoff(&["check-layers", shipped.to_str().unwrap()], &[]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("Dockerfile");
    std::fs::write(&bad, "FROM python\nCOPY . .\nRUN pip install -r requirements.txt\n").unwrap();
    let out = handoff(&["check-layers", bad.to_str().unwrap()], &[]);
    assert_eq!(out.status.code(), Some(1));
}

/// Test that `run` refuses to hand off when it cannot drop privileges
#[test]
fn test_run_without_root_never_execs() {
    if is_root() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let mut args = vec!["run", "--"];
    let touch = touch_command(&marker);
    args.extend(touch.iter().map(String::as_str));

    let out = handoff(
        &args,
        &[
            ("HANDOFF_USER", "65534:65534"),
            ("HANDOFF_SKIP_CHOWN", "1"),
            ("HANDOFF_APP_ROOT", dir.path().to_str().unwrap()),
        ],
    );

    assert_eq!(out.status.code(), Some(EX_NOPERM));
    assert!(!marker.exists());
}

/// Test the whole bootstrap: re-own the app root, drop, exec in place
#[test]
#[ignore = "Requires root"]
fn test_run_as_root_hands_off() {
    use std::os::unix::fs::MetadataExt;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data/state.db"), "").unwrap();

    let child = Command::new(HANDOFF)
        .args(["run", "--", "sh", "-c", "id -u; id -g; echo $$; pwd"])
        .env_remove("HANDOFF_REQUIRE_ENV")
        .env_remove("HANDOFF_SKIP_CHOWN")
        .env("HANDOFF_USER", "65534:65534")
        .env("HANDOFF_APP_ROOT", dir.path())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let pid = child.id();
    let out = child.wait_with_output().unwrap();
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "65534");
    assert_eq!(lines[1], "65534");
    assert_eq!(lines[2], pid.to_string());
    assert_eq!(Path::new(lines[3]), dir.path().canonicalize().unwrap());

    for path in [dir.path().to_path_buf(), dir.path().join("data/state.db")] {
        let meta = std::fs::symlink_metadata(&path).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (65534, 65534), "{}", path.display());
    }
}

/// Test drop-privs usage errors
#[test]
fn test_drop_privs_usage() {
    let out = Command::new(DROP_PRIVS).output().unwrap();
    assert_eq!(out.status.code(), Some(EX_USAGE));

    let out = Command::new(DROP_PRIVS).arg("app").output().unwrap();
    assert_eq!(out.status.code(), Some(EX_USAGE));

    let out = Command::new(DROP_PRIVS).args(["a:b:c", "true"]).output().unwrap();
    assert_eq!(out.status.code(), Some(EX_USAGE));
}

/// Test that an unresolvable identity never runs the command
#[test]
fn test_drop_privs_unknown_user() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let out = Command::new(DROP_PRIVS)
        .arg("no-such-user-handoff")
        .args(touch_command(&marker))
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(EX_NOUSER));
    assert!(!marker.exists());
}

/// Test that an unprivileged caller is refused
#[test]
fn test_drop_privs_requires_root() {
    if is_root() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let out = Command::new(DROP_PRIVS)
        .arg("65534:65534")
        .args(touch_command(&marker))
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(EX_NOPERM));
    assert!(!marker.exists());
}

/// Test a real drop: the child sees only the target ids
#[test]
#[ignore = "Requires root"]
fn test_drop_privs_as_root() {
    let out = Command::new(DROP_PRIVS)
        .args(["65534:65534", "sh", "-c", "id -u; id -g; id -G; echo $HOME"])
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "65534");
    assert_eq!(lines[1], "65534");
    assert_eq!(lines[2], "65534");
}

/// Test that the exec'd command keeps the entrypoint's pid
#[test]
#[ignore = "Requires root"]
fn test_drop_privs_keeps_pid() {
    let child = Command::new(DROP_PRIVS)
        .args(["65534:65534", "sh", "-c", "echo $$"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let pid = child.id();
    let out = child.wait_with_output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), pid.to_string());
}

/// Test that a missing program maps to 127 after the drop
#[test]
#[ignore = "Requires root"]
fn test_drop_privs_missing_program() {
    let out = Command::new(DROP_PRIVS)
        .args(["65534:65534", "/nonexistent/program"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(127));
}
