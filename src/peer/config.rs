//! Virtual peer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::peer::PeerError;

/// Largest message the 2-byte length prefix can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Default number of reconnect attempts after an unexpected disconnect.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Default pause before each reconnect attempt in seconds.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Default interval between revocation checks in seconds.
pub const DEFAULT_REVOCATION_CHECK_INTERVAL_SECS: u64 = 15 * 60;

/// Configuration for virtual peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PeerConfig {
    /// Maximum size of one application message.
    pub max_message_size: usize,

    /// Reconnect attempts after a transport failure (0 disables reconnects).
    pub reconnect_attempts: u32,

    /// Delay before each reconnect attempt.
    pub reconnect_delay_secs: u64,

    /// Re-check the remote certificate for revocation this often (`None` disables).
    pub revocation_check_interval_secs: Option<u64>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            revocation_check_interval_secs: Some(DEFAULT_REVOCATION_CHECK_INTERVAL_SECS),
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), PeerError> {
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidConfig(format!(
                "max message size must be between 1 and {}",
                MAX_MESSAGE_SIZE
            )));
        }
        if self.revocation_check_interval_secs == Some(0) {
            return Err(PeerError::InvalidConfig(
                "revocation check interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn revocation_check_interval(&self) -> Option<Duration> {
        self.revocation_check_interval_secs.map(Duration::from_secs)
    }
}
