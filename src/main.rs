//! handoff CLI - container entrypoint and build-time checks

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use handoff::bootstrap::{self, BootPlan};
use handoff::error::{BootError, EX_CONFIG, EX_IOERR};
use handoff::layers::{self, LayerError};
use handoff::probe::{self, ProbeOptions};
use handoff::telemetry;
use handoff::{BootConfig, ListenAddr, LogFormat};

#[derive(Parser)]
#[command(name = "handoff")]
#[command(author, version, about = "Root-to-service-account container entrypoint")]
struct Cli {
    /// Defaults to `run` with the default server command
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize ownership, drop privileges and exec the application
    Run {
        /// Command to exec instead of the default server
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },

    /// Print what `run` would do, as JSON, without side effects
    Plan {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },

    /// Wait until the application accepts connections
    Probe {
        /// Host to probe (defaults to HOST, wildcard mapped to loopback)
        #[arg(long)]
        host: Option<String>,

        /// Port to probe (defaults to PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Also GET this path and require a non-5xx status
        #[arg(long)]
        http_path: Option<String>,

        /// Startup window in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,

        /// Delay between attempts in milliseconds
        #[arg(short, long, default_value = "500")]
        interval: u64,
    },

    /// Verify the dependency install layer sits before the source copy
    CheckLayers {
        /// Dockerfile to check
        dockerfile: PathBuf,

        /// Dependency manifest file name
        #[arg(short, long, default_value = "requirements.txt")]
        manifest: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command.unwrap_or(Commands::Run {
        command: Vec::new(),
    }) {
        Commands::Run { command } => run(command),
        Commands::Plan { command } => plan(command),
        Commands::Probe {
            host,
            port,
            http_path,
            timeout,
            interval,
        } => run_probe(host, port, http_path, timeout, interval),
        Commands::CheckLayers {
            dockerfile,
            manifest,
        } => check_layers(dockerfile, &manifest),
    };

    std::process::exit(code);
}

/// Load config and start logging; on failure the exit code to use
fn load_config() -> Result<BootConfig, i32> {
    match BootConfig::from_env() {
        Ok(config) => {
            if let Err(e) = telemetry::init_logging(config.log_format) {
                eprintln!("handoff: logging disabled: {}", e);
            }
            Ok(config)
        }
        Err(e) => {
            let _ = telemetry::init_logging(LogFormat::Text);
            let err = BootError::from(e);
            bootstrap::record_failure(None, &err);
            Err(err.exit_code())
        }
    }
}

fn run(command: Vec<OsString>) -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    match bootstrap::run(&config, command) {
        Ok(never) => match never {},
        Err(err) => {
            bootstrap::record_failure(Some(&config), &err);
            err.exit_code()
        }
    }
}

fn plan(command: Vec<OsString>) -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    match BootPlan::resolve(
        &config,
        command,
        std::env::vars_os(),
        telemetry::new_boot_id(),
    ) {
        Ok(plan) => {
            println!("{:#}", plan.to_json());
            0
        }
        Err(err) => {
            tracing::error!(stage = err.stage(), error = %err, "plan failed");
            err.exit_code()
        }
    }
}

fn run_probe(
    host: Option<String>,
    port: Option<u16>,
    http_path: Option<String>,
    timeout: u64,
    interval: u64,
) -> i32 {
    let _ = telemetry::init_logging(LogFormat::Text);

    let env: HashMap<String, String> = std::env::vars().collect();
    let listen = match ListenAddr::from_lookup(|key| env.get(key).cloned()) {
        Ok(listen) => listen,
        Err(e) => {
            tracing::error!(error = %e, "invalid listen address");
            return EX_CONFIG;
        }
    };

    let mut options = ProbeOptions::for_listen(&listen);
    if let Some(host) = host {
        options.host = host;
    }
    if let Some(port) = port {
        options.port = port;
    }
    options.http_path = http_path;
    options.timeout = Duration::from_secs(timeout);
    options.interval = Duration::from_millis(interval);

    match probe::wait_ready_blocking(&options) {
        Ok(outcome) => {
            tracing::info!(
                attempts = outcome.attempts,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                status = ?outcome.status,
                "application ready"
            );
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "application not ready");
            1
        }
    }
}

fn check_layers(dockerfile: PathBuf, manifest: &str) -> i32 {
    let _ = telemetry::init_logging(LogFormat::Text);

    match layers::check_file(&dockerfile, manifest) {
        Ok(report) => {
            tracing::info!(
                stage = %report.stage,
                manifest_line = report.manifest_line,
                install_line = report.install_line,
                source_line = ?report.source_line,
                "dependency layer is cached independently of the source"
            );
            0
        }
        Err(e @ LayerError::Io { .. }) => {
            tracing::error!(error = %e, "cannot check layers");
            EX_IOERR
        }
        Err(e) => {
            tracing::error!(dockerfile = %dockerfile.display(), error = %e, "layer ordering check failed");
            1
        }
    }
}
