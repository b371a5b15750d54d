//! voxd daemon binary.

use clap::Parser;
use std::path::PathBuf;
use voxd::config::Config;
use voxd::daemon::run_daemon;

/// Real-time speech-to-text daemon
#[derive(Parser, Debug)]
#[command(name = "voxd", version, about = "Real-time speech-to-text daemon")]
struct Cli {
    /// Path to configuration file (default: ~/.config/voxd/config.json)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Unix socket path (overrides the configuration file)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Suppress status messages
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("voxd: {}", e);
            1
        }
    });
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().or_else(Config::default_path);

    let mut config = match &config_path {
        Some(path) => {
            if cli.config.is_some() {
                // An explicitly named file must exist and parse.
                Config::load(path)?
            } else {
                Config::load_or_default(path)?
            }
        }
        None => Config::default(),
    }
    .with_env_overrides();

    if let Some(socket) = &cli.socket {
        config.ipc.socket_path = socket.to_string_lossy().into_owned();
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_daemon(config, config_path, cli.quiet))?;
    Ok(())
}
