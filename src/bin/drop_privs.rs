//! drop-privs - become USER[:GROUP] for good, then exec CMD
//!
//! ```text
//! drop-privs app:app gunicorn --bind 0.0.0.0:8050 app.main:app
//! ```
//!
//! Must start as root. The process keeps its pid and descriptors; only
//! HOME, USER and LOGNAME are rewritten in the inherited environment.

use std::ffi::OsString;

use clap::error::ErrorKind;
use clap::Parser;

use handoff::error::{EX_NOPERM, EX_NOUSER, EX_USAGE};
use handoff::identity::{self, IdentitySpec};
use handoff::launch::{EnvBuilder, LaunchCommand};
use handoff::security::{self, DropOptions};
use handoff::{telemetry, LogFormat};

#[derive(Parser)]
#[command(name = "drop-privs")]
#[command(author, version, about = "Irreversibly drop root and exec a command")]
struct Cli {
    /// Target identity, name or numeric id, optional :GROUP
    identity: IdentitySpec,

    /// Set PR_SET_NO_NEW_PRIVS before exec
    #[arg(long)]
    no_new_privs: bool,

    /// Command and arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(EX_USAGE);
        }
    };

    let _ = telemetry::init_logging(LogFormat::Text);

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let identity = match identity::resolve(&cli.identity) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(identity = %cli.identity, error = %e, "cannot resolve identity");
            return EX_NOUSER;
        }
    };

    let env = EnvBuilder::inherit(std::env::vars_os())
        .identity(&identity)
        .build();

    let launch = match LaunchCommand::from_argv(cli.command, env, None) {
        Ok(launch) => launch,
        Err(e) => {
            tracing::error!(error = %e, "no command given");
            return EX_USAGE;
        }
    };

    let options = DropOptions {
        no_new_privs: cli.no_new_privs,
    };
    if let Err(e) = security::drop_privileges(&identity, &options) {
        tracing::error!(uid = identity.uid, gid = identity.gid, error = %e, "privilege drop failed");
        return EX_NOPERM;
    }

    tracing::debug!(program = %launch.program_name(), uid = identity.uid, "exec");
    let err = launch.exec();
    tracing::error!(program = %launch.program_name(), error = %err, "exec failed");
    err.exit_code()
}
