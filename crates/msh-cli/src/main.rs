//! meshsh CLI
//!
//! Single binary for both ends of a remote shell:
//! - listener (runs a program on a PTY for authenticated peers)
//! - client (attaches the local terminal to a listener's program)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshsh::commands::{self, ConnectOptions, ListenOptions};
use msh_core::config::{self, ConfigFile};

#[derive(Parser)]
#[command(name = "meshsh")]
#[command(author, version, about = "Remote shell over identity-addressed links")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity file to use
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,

    /// Service name to listen on or print the destination of
    #[arg(short, long, global = true)]
    service: Option<String>,

    /// More log output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less log output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the identity hash and exit
    Identity {
        /// Use the listener identity and also print the destination it serves
        #[arg(short, long)]
        listen: bool,
    },

    /// Serve a program to authenticated peers
    Listen {
        /// Identity hash allowed to connect (repeatable)
        #[arg(short = 'a', long = "allowed", value_name = "HASH")]
        allowed: Vec<String>,
        /// Accept any peer, identified or not
        #[arg(short = 'n', long)]
        no_auth: bool,
        /// Do not announce the destination
        #[arg(short = 'b', long)]
        no_announce: bool,
        /// Bind address (overrides config)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
        /// Program and arguments to run for each session (default: login shell)
        #[arg(trailing_var_arg = true, value_name = "PROGRAM")]
        program: Vec<String>,
    },

    /// Run the listener's program with this terminal attached
    Connect {
        /// Destination hash of the listener
        destination: String,
        /// Exit with the remote program's exit code
        #[arg(short, long)]
        mirror: bool,
        /// Connect without identifying
        #[arg(short = 'N', long = "no-id")]
        no_id: bool,
        /// Connect and request timeout in seconds
        #[arg(short = 'w', long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Listener address, skipping discovery
        #[arg(long, value_name = "HOST:PORT")]
        via: Option<String>,
    },
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Log level from a base index into `LEVELS` shifted by -v and -q
fn log_level(base: usize, verbose: u8, quiet: u8) -> &'static str {
    let level = base as i32 + i32::from(verbose) - i32::from(quiet);
    if level < 0 {
        return "off";
    }
    LEVELS[(level as usize).min(LEVELS.len() - 1)]
}

fn load_config(config_path: Option<&PathBuf>) -> Result<ConfigFile> {
    if let Some(config_path) = config_path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        tracing::debug!("Using default configuration");
        return Ok(ConfigFile::default());
    }
    Ok(config::load_config(&default_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
        ConfigFile::default()
    }))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // The listener reports sessions by default; the client stays out of the terminal
    let base = match cli.command {
        Commands::Listen { .. } => 2,
        _ => 1,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| log_level(base, cli.verbose, cli.quiet).into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Identity { listen } => {
            let configured = if listen {
                config.listener.identity_path.as_deref()
            } else {
                config.client.identity_path.as_deref()
            };
            let path = commands::identity_path(cli.identity.as_deref(), configured, listen);
            let service = cli
                .service
                .unwrap_or_else(|| config.listener.service_name.clone());
            commands::identity_command(&path, &service, listen)?;
        }

        Commands::Listen {
            allowed,
            no_auth,
            no_announce,
            bind,
            program,
        } => {
            let path = commands::identity_path(
                cli.identity.as_deref(),
                config.listener.identity_path.as_deref(),
                true,
            );
            let options = ListenOptions {
                service: cli.service,
                allowed,
                no_auth,
                no_announce,
                bind,
                program,
            };
            commands::listen_command(config, &path, options).await?;
        }

        Commands::Connect {
            destination,
            mirror,
            no_id,
            timeout,
            via,
        } => {
            let path = commands::identity_path(
                cli.identity.as_deref(),
                config.client.identity_path.as_deref(),
                false,
            );
            let options = ConnectOptions {
                destination,
                mirror,
                no_id,
                timeout,
                via,
            };
            let code = commands::connect_command(config, &path, options).await?;
            return Ok(ExitCode::from(code));
        }
    }

    Ok(ExitCode::SUCCESS)
}
