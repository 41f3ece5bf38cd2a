//! Network, peer and channel identifiers.
//!
//! A [`NetworkId`] is derived with PBKDF2 from the network's shared secret,
//! so knowing the network name alone is not enough to find its members.
//! Two peers meeting on a network compute the same [`ChannelName`] from the
//! network id and both peer ids.

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::normalize_email;
use crate::network::NetworkError;

type HmacSha256 = Hmac<Sha256>;

/// Size of network ids, peer ids and channel names.
pub const ID_SIZE: usize = 20;

/// PBKDF2 iteration count for network ids.
pub const NETWORK_ID_ITERATIONS: u32 = 10_000;

/// Separator between the two emails of a private network.
const PRIVATE_SEPARATOR: char = '|';

/// Salt prefix keeping invitation ids apart from group ids.
const INVITATION_PREFIX: &str = "invitation:";

/// HKDF label for the network pre-shared key.
const LABEL_NETWORK_PSK: &[u8] = b"PEERLINK-NETWORK-PSK";

/// Size of the derived network pre-shared key.
pub const PSK_SIZE: usize = 32;

macro_rules! hex_id {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, NetworkError> {
                let bytes = hex::decode(s.trim())
                    .map_err(|e| NetworkError::InvalidId(e.to_string()))?;
                let bytes: [u8; ID_SIZE] = bytes.try_into().map_err(|_| {
                    NetworkError::InvalidId(format!("expected {} bytes", ID_SIZE))
                })?;
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}..)", stringify!($name), &self.to_hex()[..8])
            }
        }
    };
}

/// Identifier of a chat network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId([u8; ID_SIZE]);

hex_id!(NetworkId);

impl NetworkId {
    /// Id of a named group network.
    pub fn for_group(name: &str, secret: &[u8]) -> Self {
        Self::derive(secret, &name.trim().to_lowercase())
    }

    /// Id of the private network between two email addresses.
    ///
    /// Order of the two addresses does not matter.
    pub fn for_private(email_a: &str, email_b: &str, secret: &[u8]) -> Self {
        let mut emails = [normalize_email(email_a), normalize_email(email_b)];
        emails.sort();
        let salt = format!("{}{}{}", emails[0], PRIVATE_SEPARATOR, emails[1]);
        Self::derive(secret, &salt)
    }

    /// Id of a private network set up from an invitation, before the
    /// counterpart's email is known.
    pub fn for_invitation(invitation: &str, secret: &[u8]) -> Self {
        Self::derive(
            secret,
            &format!("{}{}", INVITATION_PREFIX, invitation.trim().to_lowercase()),
        )
    }

    fn derive(secret: &[u8], salt: &str) -> Self {
        let mut id = [0u8; ID_SIZE];
        pbkdf2_hmac::<Sha256>(secret, salt.as_bytes(), NETWORK_ID_ITERATIONS, &mut id);
        Self(id)
    }

    /// Pre-shared key mixed into every handshake on this network.
    pub fn psk(&self, secret: &[u8]) -> Zeroizing<Vec<u8>> {
        let hk = Hkdf::<Sha256>::new(Some(&self.0), secret);
        let mut psk = Zeroizing::new(vec![0u8; PSK_SIZE]);
        // Fixed length, far below the 255 * 32 byte HKDF-SHA256 limit.
        hk.expand(LABEL_NETWORK_PSK, &mut psk)
            .expect("32 bytes is valid output length");
        psk
    }
}

/// Random per-node identifier announced before each handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; ID_SIZE]);

hex_id!(PeerId);

impl PeerId {
    pub fn random() -> Self {
        let mut id = [0u8; ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }
}

/// Per-pair channel name on a network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelName([u8; ID_SIZE]);

hex_id!(ChannelName);

impl ChannelName {
    /// Name of the channel between `a` and `b` on `network`. Symmetric in
    /// `a` and `b`.
    pub fn derive(network: &NetworkId, a: &PeerId, b: &PeerId) -> Self {
        let tag = Self::mac(network, a, b).finalize().into_bytes();
        let mut name = [0u8; ID_SIZE];
        name.copy_from_slice(&tag[..ID_SIZE]);
        Self(name)
    }

    /// Constant-time check that this is the name of `a`/`b` on `network`.
    pub fn matches(&self, network: &NetworkId, a: &PeerId, b: &PeerId) -> bool {
        Self::mac(network, a, b)
            .verify_truncated_left(&self.0)
            .is_ok()
    }

    fn mac(network: &NetworkId, a: &PeerId, b: &PeerId) -> HmacSha256 {
        let (low, high) = if a.0 <= b.0 { (a, b) } else { (b, a) };
        // HMAC takes keys of any length; this only fails for fixed-key MACs.
        let mut mac = <HmacSha256 as Mac>::new_from_slice(network.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(&low.0);
        mac.update(&high.0);
        mac
    }
}
