//! Peerlink - encrypted P2P chat networks
//!
//! A CLI for creating identities and chatting over mutually authenticated,
//! encrypted channels.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ChatCommand, CommandExecutor, KeygenCommand, NetworkIdCommand};

/// Default log filter when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "peerlink=info";

/// Peerlink - encrypted P2P chat networks
///
/// Members hold certificates issued by a common authority and meet on
/// networks derived from a shared secret.
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(version)]
#[command(about = "Mutually authenticated, encrypted P2P chat networks")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a signing key and certificate
    Keygen(KeygenCommand),

    /// Print a network id and optionally a channel name
    NetworkId(NetworkIdCommand),

    /// Join a network and chat with its members
    Chat(ChatCommand),
}

impl Commands {
    fn executor(&self) -> &dyn CommandExecutor {
        match self {
            Commands::Keygen(cmd) => cmd,
            Commands::NetworkId(cmd) => cmd,
            Commands::Chat(cmd) => cmd,
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    cli.command.executor().execute()
}
