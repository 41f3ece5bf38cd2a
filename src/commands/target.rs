//! Network selection shared by the commands that work on one network.

use anyhow::{bail, Result};
use clap::Args;

use peerlink::network::{NetworkId, NetworkMembership, NetworkRegistry};

/// Which network to work with. Exactly one kind must be given.
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct NetworkTarget {
    /// Group network, open to every trusted member knowing the secret
    #[arg(long, value_name = "NAME")]
    pub group: Option<String>,

    /// Private network with exactly one other member
    #[arg(long, value_name = "EMAIL")]
    pub private: Option<String>,

    /// Invitation network, bound to the first member who joins it
    #[arg(long, value_name = "NAME")]
    pub invitation: Option<String>,
}

impl NetworkTarget {
    /// Derive the network id. `own_email` is only needed for private networks.
    pub fn network_id(&self, own_email: Option<&str>, secret: &[u8]) -> Result<NetworkId> {
        if let Some(name) = &self.group {
            return Ok(NetworkId::for_group(name, secret));
        }
        if let Some(name) = &self.invitation {
            return Ok(NetworkId::for_invitation(name, secret));
        }
        match (&self.private, own_email) {
            (Some(counterpart), Some(own)) => Ok(NetworkId::for_private(own, counterpart, secret)),
            (Some(_), None) => bail!("--email is required for private networks"),
            (None, _) => bail!("one of --group, --private or --invitation is required"),
        }
    }

    /// Join the selected network on `registry`.
    pub fn join(&self, registry: &NetworkRegistry, secret: &[u8]) -> Result<NetworkMembership> {
        let membership = if let Some(name) = &self.group {
            registry.join_group(name, secret)?
        } else if let Some(counterpart) = &self.private {
            registry.join_private(counterpart, secret)?
        } else if let Some(name) = &self.invitation {
            registry.join_invitation(name, secret)?
        } else {
            bail!("one of --group, --private or --invitation is required");
        };
        Ok(membership)
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match (&self.group, &self.private, &self.invitation) {
            (Some(name), _, _) => format!("group '{}'", name),
            (_, Some(email), _) => format!("private network with {}", email),
            (_, _, Some(name)) => format!("invitation '{}'", name),
            _ => "no network".to_string(),
        }
    }
}
