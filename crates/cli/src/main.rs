use std::{ffi::OsString, path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::prelude::*;

use ovjail_sandbox::current as sandbox;

/// Create a child process in a sandboxed environment without modifying any
/// existing file (using overlayFS).
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Set up an empty /home on tmpfs.
    #[arg(long)]
    empty_home: bool,

    /// Set up an empty /proc. This implies a new PID namespace; software
    /// relying on a shared pid namespace (PulseAudio, ...) may not work.
    #[arg(long)]
    empty_proc: bool,

    /// Add IPC isolation and create a new PID namespace. Some software might
    /// not work or fail at unexpected points, but security levels increase
    /// greatly.
    #[arg(short, long)]
    strict: bool,

    /// Quick combination of --empty-home, --empty-proc and --strict.
    #[arg(short, long)]
    jail: bool,

    /// Use a fixed path for the overlayFS scratch area (otherwise a fresh
    /// directory under /dev/shm is used).
    #[arg(short, long, value_name = "PATH")]
    overlay_dir: Option<PathBuf>,

    /// Print the directories that are never overlaid and quit.
    #[arg(long)]
    skip_dirs: bool,

    /// Do not print any logline.
    #[arg(long)]
    silent: bool,

    /// The command to run and its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "CMD")]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    let args = match argfile::expand_args_from(
        std::env::args_os(),
        argfile::parse_fromfile,
        argfile::PREFIX,
    ) {
        Ok(args) => args,
        Err(error) => {
            eprintln!("failed to expand the argument file: {}", error);
            return ExitCode::FAILURE;
        }
    };
    let cli = Cli::parse_from(args);

    if !cli.silent {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    }

    if cli.skip_dirs {
        println!("Directories to not overlay:\n");
        for dir in sandbox::SKIP_DIRS {
            println!("{}", dir);
        }
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // --silent never silences the exit code, only the diagnostics.
            tracing::error!(?error, "ovjail failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = sandbox::SandboxConfig::new(cli.command)?;
    config.empty_home = cli.empty_home || cli.jail;
    config.empty_proc = cli.empty_proc || cli.jail;
    config.strict = cli.strict || cli.jail;
    config.overlay_dir = cli.overlay_dir;

    tracing::info!("starting ovjail");
    let outcome = sandbox::run(&config)?;
    tracing::debug!(?outcome, "sandbox finished");

    Ok(())
}
