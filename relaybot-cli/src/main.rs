//! Relaybot CLI: runs the Telegram relay.
//!
//! `relaybot run` (the default) polls Telegram and relays assembled messages
//! to the chat API until interrupted.

mod commands;
mod run;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Relaybot: coalesces multi-part Telegram messages before asking the chat API
#[derive(Parser, Debug)]
#[command(name = "relaybot", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the relay (default)
    Run,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file if none exists
    Init,
    /// Print the effective configuration as TOML
    Show,
}

/// Keeps the file writer flushing until dropped.
fn init_tracing(verbose: u8, quiet: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging; RUST_LOG overrides its level.
    let log_dir = directories::ProjectDirs::from("dev", "relaybot", "relaybot")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "relaybot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = relaybot_core::load_config(cli.config.as_deref(), None)
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            run::run(config).await
        }
        Commands::Config { action } => commands::handle_config(action, cli.config.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["relaybot"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_config_show_with_flags() {
        let cli =
            Cli::try_parse_from(["relaybot", "config", "show", "-c", "relay.toml", "-vv"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Config {
                action: ConfigAction::Show
            })
        ));
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
        assert_eq!(cli.verbose, 2);
    }
}
