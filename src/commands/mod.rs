//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod chat;
mod keygen;
mod network_id;
mod node_config;
mod target;

pub use chat::ChatCommand;
pub use keygen::KeygenCommand;
pub use network_id::NetworkIdCommand;
pub use node_config::NodeConfig;
pub use target::NetworkTarget;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Prompt for a network secret (input hidden).
pub(crate) fn prompt_secret(prompt: &str) -> Result<Zeroizing<String>> {
    let secret = rpassword::prompt_password(prompt).context("Failed to read network secret")?;
    Ok(Zeroizing::new(secret))
}

/// Use the secret given on the command line or ask for it.
pub(crate) fn resolve_secret(given: Option<&str>) -> Result<Zeroizing<String>> {
    match given {
        Some(secret) => Ok(Zeroizing::new(secret.to_string())),
        None => prompt_secret("Network secret: "),
    }
}
