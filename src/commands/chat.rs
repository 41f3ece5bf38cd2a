//! Chat command: join one network and exchange lines with its members.
//!
//! Lines typed on stdin are broadcast to every online peer. A few
//! commands are understood:
//!
//! - `/peers` - list known peers and their state
//! - `/msg <email> <text>` - send to one peer only
//! - `/quit` - leave the network and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use peerlink::channel::TcpListener;
use peerlink::network::{NetworkEvent, NetworkMembership, NetworkRegistry};
use peerlink::peer::PeerEvent;

use super::{resolve_secret, CommandExecutor, NetworkTarget, NodeConfig};

/// Start an interactive chat on a network.
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Node configuration file (TOML)
    #[arg(short, long, default_value = "peerlink.toml")]
    pub config: PathBuf,

    #[command(flatten)]
    pub target: NetworkTarget,

    /// Network secret (prompted if omitted)
    #[arg(long)]
    pub secret: Option<String>,

    /// Address to listen on (overrides the configuration)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Do not accept inbound connections
    #[arg(long, conflicts_with = "listen")]
    pub no_listen: bool,

    /// Peer addresses to connect to (host:port)
    #[arg(short = 'p', long = "connect", value_name = "ADDR")]
    pub connect: Vec<String>,
}

impl CommandExecutor for ChatCommand {
    fn execute(&self) -> Result<()> {
        let config = NodeConfig::load(&self.config)?;
        let secret = resolve_secret(self.secret.as_deref())?;

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(self.run(config, secret.as_bytes()))
    }
}

/// What to do with one line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Broadcast(&'a str),
    Direct { email: &'a str, text: &'a str },
    Peers,
    Quit,
    Empty,
    Unknown(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Broadcast(line);
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "quit" | "exit" => Input::Quit,
        "peers" => Input::Peers,
        "msg" => match rest.trim().split_once(' ') {
            Some((email, text)) if !text.trim().is_empty() => Input::Direct {
                email,
                text: text.trim(),
            },
            _ => Input::Unknown(line),
        },
        _ => Input::Unknown(line),
    }
}

impl ChatCommand {
    async fn run(&self, config: NodeConfig, secret: &[u8]) -> Result<()> {
        let node = config.local_node()?;
        let own_email = node.email();
        let (registry, mut events) = NetworkRegistry::new(node);
        let network = self.target.join(&registry, secret)?;

        println!("Signed in as {}", own_email);
        println!("Joined {} ({})", self.target.describe(), network.id());

        if !self.no_listen {
            let addr = self
                .listen
                .as_deref()
                .unwrap_or_else(|| config.listen_addr());
            let listener = TcpListener::bind(addr).await?;
            println!("Listening on {}", listener.local_addr()?);
            let serving = Arc::clone(&registry);
            tokio::spawn(async move {
                if let Err(e) = serving.serve(listener).await {
                    warn!(error = %e, "listener stopped");
                }
            });
        }

        for addr in &self.connect {
            match network.connect_tcp(addr).await {
                Ok(peer) => println!("Connected to {} at {}", peer.email(), addr),
                Err(e) => eprintln!("Could not connect to {}: {}", addr, e),
            }
        }

        println!("Type a message and press enter. /peers, /msg <email> <text>, /quit");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read stdin")? else {
                        break;
                    };
                    if !handle_input(&network, parse_input(&line)).await {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => print_event(&event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        registry.shutdown().await;
        println!("Bye.");
        Ok(())
    }
}

/// Returns false when the session should end.
async fn handle_input(network: &NetworkMembership, input: Input<'_>) -> bool {
    match input {
        Input::Quit => return false,
        Input::Empty => {}
        Input::Broadcast(text) => {
            let delivered = network.broadcast(text.as_bytes()).await;
            if delivered == 0 {
                println!("(nobody online)");
            }
        }
        Input::Direct { email, text } => {
            if let Err(e) = network.send_to(email, text.as_bytes()).await {
                println!("(not sent: {})", e);
            }
        }
        Input::Peers => {
            let peers = network.peers();
            if peers.is_empty() {
                println!("(no peers)");
            }
            for peer in peers {
                let state = if peer.is_online() {
                    format!("online, {} channel(s)", peer.channel_count())
                } else {
                    "offline".to_string()
                };
                println!("  {} [{}]", peer.email(), state);
            }
        }
        Input::Unknown(line) => println!("(unknown command: {})", line),
    }
    true
}

fn print_event(event: &NetworkEvent) {
    let peer = &event.peer;
    match &event.event {
        PeerEvent::MessageReceived(message) => {
            println!("<{}> {}", peer, String::from_utf8_lossy(message));
        }
        PeerEvent::Online => println!("* {} is online", peer),
        PeerEvent::Offline { graceful: true } => println!("* {} left", peer),
        PeerEvent::Offline { graceful: false } => println!("* {} dropped", peer),
        PeerEvent::Reconnecting { attempt } => {
            println!("* reconnecting to {} (attempt {})", peer, attempt)
        }
        PeerEvent::CertificateChanged { previous, current } => println!(
            "! {} presents a new certificate (serial {} -> {})",
            peer,
            hex::encode(previous.serial()),
            hex::encode(current.serial())
        ),
        PeerEvent::InvalidCertificate { reason } => {
            println!("! certificate of {} rejected: {}", peer, reason)
        }
        PeerEvent::SecurityFailure(reason) => {
            println!("! security failure with {}: {}", peer, reason)
        }
    }
}
