//! Node configuration file for the chat command.
//!
//! ```toml
//! certificate = "alice.cert"
//! key = "alice.key"
//! roots = ["ca.cert"]
//! listen = "0.0.0.0:7300"
//! revoked = ["5f0c..."]
//!
//! [channel]
//! record_size = 16384
//!
//! [peer]
//! reconnect_attempts = 3
//! ```
//!
//! Relative paths are resolved against the directory of the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use peerlink::channel::ChannelConfig;
use peerlink::crypto::{Certificate, Identity, RevocationList, SigningKeyPair, TrustStore};
use peerlink::network::LocalNode;
use peerlink::peer::PeerConfig;

/// Default address to listen on when none is configured.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:7300";

/// Everything a node needs to take part in networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Path to this node's certificate (PEM).
    pub certificate: PathBuf,
    /// Path to this node's private key (PEM).
    pub key: PathBuf,
    /// Trusted root certificates.
    pub roots: Vec<PathBuf>,
    /// Address to accept connections on, [`DEFAULT_LISTEN`] when unset.
    #[serde(default)]
    pub listen: Option<String>,
    /// Serials (hex) of revoked certificates.
    #[serde(default)]
    pub revoked: Vec<String>,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.certificate);
        resolve(&mut self.key);
        self.roots.iter_mut().for_each(resolve);
    }

    /// Check the embedded channel and peer settings.
    pub fn validate(&self) -> Result<()> {
        if self.roots.is_empty() {
            bail!("at least one trusted root is required");
        }
        self.channel.validate()?;
        self.peer.validate()?;
        Ok(())
    }

    /// Load the identity, roots and revocation list and build the node.
    pub fn local_node(&self) -> Result<LocalNode> {
        let certificate = Certificate::load(&self.certificate)
            .with_context(|| format!("Failed to load {}", self.certificate.display()))?;
        let keys = SigningKeyPair::load(&self.key)
            .with_context(|| format!("Failed to load {}", self.key.display()))?;
        let identity = Identity::new(certificate, keys).context("Key does not match certificate")?;

        let mut trust = TrustStore::default();
        for path in &self.roots {
            let root = Certificate::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            trust.add_root(root);
        }

        let node = LocalNode::new(
            identity,
            trust,
            self.channel.clone(),
            self.peer.clone(),
        )?;

        if self.revoked.is_empty() {
            return Ok(node);
        }
        Ok(node.with_revocation(Arc::new(self.revocation_list()?)))
    }

    fn revocation_list(&self) -> Result<RevocationList> {
        let list = RevocationList::new();
        for serial in &self.revoked {
            let bytes = hex::decode(serial.trim())
                .with_context(|| format!("Invalid revoked serial '{}'", serial))?;
            let serial: [u8; 16] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Revoked serial '{}' is not 16 bytes", serial))?;
            list.revoke(serial);
        }
        Ok(list)
    }

    /// Listen address, falling back to [`DEFAULT_LISTEN`].
    pub fn listen_addr(&self) -> &str {
        self.listen.as_deref().unwrap_or(DEFAULT_LISTEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::KeygenCommand;
    use tempfile::tempdir;

    fn keygen(dir: &Path, name: &str, issuer: Option<&str>) {
        KeygenCommand {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            output: dir.join(name),
            authority: issuer.is_none(),
            issuer: issuer.map(|i| dir.join(i)),
            validity_days: 30,
            revocation_url: None,
        }
        .generate()
        .unwrap();
    }

    #[test]
    fn test_load_relative_paths() {
        let dir = tempdir().unwrap();
        keygen(dir.path(), "ca", None);
        keygen(dir.path(), "alice", Some("ca"));

        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            r#"
certificate = "alice.cert"
key = "alice.key"
roots = ["ca.cert"]

[channel]
record_size = 4096

[peer]
reconnect_attempts = 1
"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.certificate, dir.path().join("alice.cert"));
        assert_eq!(config.channel.record_size, 4096);
        assert_eq!(config.peer.reconnect_attempts, 1);
        assert_eq!(config.listen_addr(), DEFAULT_LISTEN);

        let node = config.local_node().unwrap();
        assert_eq!(node.email(), "alice@example.com");
    }

    #[test]
    fn test_requires_roots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "certificate = \"a.cert\"\nkey = \"a.key\"\nroots = []\n").unwrap();
        assert!(NodeConfig::load(&path).is_err());
    }

    #[test]
    fn test_invalid_channel_config_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(
            &path,
            "certificate = \"a.cert\"\nkey = \"a.key\"\nroots = [\"ca.cert\"]\n\n[channel]\nrecord_size = 1000\n",
        )
        .unwrap();
        assert!(NodeConfig::load(&path).is_err());
    }

    #[test]
    fn test_revoked_serials_parsed() {
        let dir = tempdir().unwrap();
        keygen(dir.path(), "ca", None);
        keygen(dir.path(), "alice", Some("ca"));

        let mut config = NodeConfig {
            certificate: dir.path().join("alice.cert"),
            key: dir.path().join("alice.key"),
            roots: vec![dir.path().join("ca.cert")],
            listen: None,
            revoked: vec!["00".repeat(16)],
            channel: ChannelConfig::default(),
            peer: PeerConfig::default(),
        };
        assert!(config.local_node().is_ok());

        config.revoked = vec!["abcd".to_string()];
        assert!(config.local_node().is_err());
    }
}
