//! Network id command.

use anyhow::{bail, Result};
use clap::Args;

use peerlink::network::{ChannelName, PeerId};

use super::{resolve_secret, CommandExecutor, NetworkTarget};

/// Print the id of a network, and optionally the channel name two nodes meet on.
#[derive(Args, Debug)]
pub struct NetworkIdCommand {
    #[command(flatten)]
    pub target: NetworkTarget,

    /// Your own email (required for private networks)
    #[arg(long)]
    pub email: Option<String>,

    /// Network secret (prompted if omitted)
    #[arg(long)]
    pub secret: Option<String>,

    /// Two peer ids (hex) to derive their channel name for
    #[arg(long, num_args = 2, value_names = ["PEER_A", "PEER_B"])]
    pub peers: Option<Vec<String>>,
}

impl CommandExecutor for NetworkIdCommand {
    fn execute(&self) -> Result<()> {
        let secret = resolve_secret(self.secret.as_deref())?;
        let id = self
            .target
            .network_id(self.email.as_deref(), secret.as_bytes())?;

        println!("Network: {}", self.target.describe());
        println!("Id:      {}", id);

        if let Some(peers) = &self.peers {
            let [a, b] = peers.as_slice() else {
                bail!("--peers takes exactly two peer ids");
            };
            let a = PeerId::from_hex(a)?;
            let b = PeerId::from_hex(b)?;
            println!("Channel: {}", ChannelName::derive(&id, &a, &b));
        }

        Ok(())
    }
}
