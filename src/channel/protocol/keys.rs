//! Master key and traffic key derivation.
//!
//! The master key is an HMAC-SHA256 keyed by the ephemeral shared secret
//! over `clientHello ‖ serverHello ‖ psk`. Per-direction cipher keys, IVs
//! and MAC keys are expanded from it with HKDF-SHA256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::channel::error::ChannelError;
use crate::channel::protocol::Role;
use crate::crypto::{CryptoError, TrafficKeys, BLOCK_SIZE};

/// Domain separation labels for HKDF derivations.
const LABEL_INITIATOR_TRAFFIC: &[u8] = b"PEERLINK-TRAFFIC-INITIATOR";
const LABEL_RESPONDER_TRAFFIC: &[u8] = b"PEERLINK-TRAFFIC-RESPONDER";

const TRAFFIC_MATERIAL_SIZE: usize = 32 + BLOCK_SIZE + 32;

/// Symmetric secret shared by both ends of one handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Split into the sending and receiving keys for `role`.
    pub fn session_keys(&self, role: Role) -> SessionKeys {
        let initiator = self.expand(LABEL_INITIATOR_TRAFFIC);
        let responder = self.expand(LABEL_RESPONDER_TRAFFIC);
        match role {
            Role::Initiator => SessionKeys {
                send: initiator,
                receive: responder,
            },
            Role::Responder => SessionKeys {
                send: responder,
                receive: initiator,
            },
        }
    }

    fn expand(&self, label: &[u8]) -> TrafficKeys {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; TRAFFIC_MATERIAL_SIZE];
        // Fixed length, far below the 255 * 32 byte HKDF-SHA256 limit.
        hk.expand(label, &mut okm)
            .expect("80 bytes is valid output length");

        let mut keys = TrafficKeys {
            cipher_key: [0u8; 32],
            iv: [0u8; BLOCK_SIZE],
            mac_key: [0u8; 32],
        };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.iv.copy_from_slice(&okm[32..32 + BLOCK_SIZE]);
        keys.mac_key.copy_from_slice(&okm[32 + BLOCK_SIZE..]);
        okm.zeroize();
        keys
    }
}

/// Traffic keys for one side of a channel.
pub struct SessionKeys {
    pub send: TrafficKeys,
    pub receive: TrafficKeys,
}

/// Derive the master key from the ephemeral shared secret and hello transcripts.
pub fn derive_master_key(
    shared_secret: &[u8],
    client_hello: &[u8],
    server_hello: &[u8],
    psk: Option<&[u8]>,
) -> Result<MasterKey, ChannelError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(shared_secret)
        .map_err(|_| ChannelError::Crypto(CryptoError::InvalidKeyLength))?;
    mac.update(client_hello);
    mac.update(server_hello);
    if let Some(psk) = psk {
        mac.update(psk);
    }
    Ok(MasterKey(mac.finalize().into_bytes().into()))
}
