//! Mount an NFSv3 export as a local filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

use nfs_fs::app_config::{Config, ExpandedPathBuf};
use nfs_fs::daemon;
use nfs_fs::trc::{Trc, TrcHandle};

#[derive(Parser)]
#[command(version, about = "Mount an NFSv3 export as a local filesystem.")]
struct Args {
    #[arg(short, long, value_parser, help = "Optional path to a config TOML.")]
    config_path: Option<PathBuf>,

    #[arg(long, help = "Storage account name (overrides the config file).")]
    account: Option<String>,

    #[arg(long, help = "Container to mount (overrides the config file).")]
    container: Option<String>,

    #[arg(long, help = "Mount point (overrides the config file).")]
    mount_point: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the filesystem.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },
}

/// Initialize tracing. Exits the process on failure.
#[expect(
    clippy::exit,
    reason = "top-level helper that intentionally terminates the process"
)]
fn init_tracing() -> TrcHandle {
    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging we can't report anything useful, \
             so exiting: {e}"
        );
        std::process::exit(1);
    })
}

#[expect(
    clippy::exit,
    reason = "main reports config errors and terminates the process"
)]
fn main() {
    let args = Args::parse();

    // Load config first; errors use eprintln since tracing isn't up yet.
    let mut config = Config::load(args.config_path.as_deref(), || {
        // No config file: account and container from the CLI are enough.
        let account = args.account.clone()?;
        let container = args.container.clone()?;
        toml::from_str(&format!(
            "account = {account:?}\ncontainer = {container:?}\n"
        ))
        .ok()
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Some(account) = args.account {
        config.account = account;
    }
    if let Some(container) = args.container {
        config.container = container;
    }
    if let Some(mount_point) = args.mount_point {
        config.mount_point = ExpandedPathBuf::new(mount_point);
    }

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    match args.command.unwrap_or(Command::Run { daemonize: false }) {
        Command::Run { daemonize } => {
            if daemonize {
                run_daemonized(&config);
            } else {
                let _trc_handle = init_tracing();
                if let Err(e) = daemon::run(&config) {
                    error!("Daemon failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Run the daemon in the background. Tracing is initialized *after* the
/// fork so its worker state lives in the child process.
#[expect(
    clippy::exit,
    reason = "top-level helper that intentionally terminates the process"
)]
fn run_daemonized(config: &Config) {
    // Pre-fork: no tracing yet; report errors with eprintln.
    let Some(pid_file_parent) = config.daemon.pid_file.parent() else {
        eprintln!("PID file path has no parent directory");
        std::process::exit(1);
    };
    if let Err(e) = std::fs::create_dir_all(pid_file_parent) {
        eprintln!("Failed to create PID file directory: {e}");
        std::process::exit(1);
    }

    let log_file = match config.daemon.log.target.open_log_file() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            std::process::exit(1);
        }
    };

    let mut daemonize = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);

    if let Some(file) = log_file {
        match file.try_clone() {
            Ok(clone) => {
                daemonize = daemonize.stdout(file).stderr(clone);
            }
            Err(e) => {
                eprintln!("Failed to clone log file handle: {e}");
                std::process::exit(1);
            }
        }
    }

    match daemonize.start() {
        Ok(()) => {
            let trc_handle = init_tracing();
            trc_handle.reconfigure_for_daemon(config.daemon.log.should_use_color());

            if let Err(e) = daemon::run(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Failed to spawn the daemon: {e}");
            std::process::exit(1);
        }
    }
}
