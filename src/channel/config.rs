//! Channel configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::error::ChannelError;
use crate::crypto::{CryptoSuite, BLOCK_SIZE};

/// Highest protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest protocol version still accepted.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Largest value the 2-byte record length field can carry.
pub const MAX_RECORD_LENGTH: usize = u16::MAX as usize;

/// Largest block-aligned record body.
pub const MAX_RECORD_SIZE: usize = MAX_RECORD_LENGTH / BLOCK_SIZE * BLOCK_SIZE;

/// Default record body size (header + payload + padding) in bytes.
pub const DEFAULT_RECORD_SIZE: usize = 16 * 1024;

/// Default number of bytes sent before a renegotiation is requested.
pub const DEFAULT_RENEGOTIATE_AFTER_BYTES: u64 = 64 * 1024 * 1024;

/// Default key epoch lifetime in seconds.
pub const DEFAULT_RENEGOTIATE_AFTER_SECS: u64 = 60 * 60;

/// Default time budget for a single handshake step in seconds.
pub const DEFAULT_HANDSHAKE_STEP_TIMEOUT_SECS: u64 = 30;

/// Default time writers wait for a renegotiation to complete, in seconds.
pub const DEFAULT_RENEGOTIATION_TIMEOUT_SECS: u64 = 60;

/// Configuration for secure channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Oldest accepted protocol version.
    pub min_version: u8,

    /// Newest spoken protocol version; every version in between is supported.
    pub max_version: u8,

    /// Offered / accepted cipher suites, most preferred first.
    pub suites: Vec<CryptoSuite>,

    /// Size of a full record body before the MAC. Multiple of the block size.
    pub record_size: usize,

    /// Request a renegotiation after this many payload bytes (`None` disables).
    pub renegotiate_after_bytes: Option<u64>,

    /// Request a renegotiation after this many seconds (`None` disables).
    pub renegotiate_after_secs: Option<u64>,

    /// Time budget for each handshake step.
    pub handshake_step_timeout_secs: u64,

    /// How long writers wait for a pending renegotiation before giving up.
    pub renegotiation_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            min_version: MIN_PROTOCOL_VERSION,
            max_version: PROTOCOL_VERSION,
            suites: CryptoSuite::ALL.to_vec(),
            record_size: DEFAULT_RECORD_SIZE,
            renegotiate_after_bytes: Some(DEFAULT_RENEGOTIATE_AFTER_BYTES),
            renegotiate_after_secs: Some(DEFAULT_RENEGOTIATE_AFTER_SECS),
            handshake_step_timeout_secs: DEFAULT_HANDSHAKE_STEP_TIMEOUT_SECS,
            renegotiation_timeout_secs: DEFAULT_RENEGOTIATION_TIMEOUT_SECS,
        }
    }
}

impl ChannelConfig {
    /// Config restricted to the given suites.
    pub fn with_suites(suites: &[CryptoSuite]) -> Self {
        Self {
            suites: suites.to_vec(),
            ..Default::default()
        }
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.min_version == 0 || self.min_version > self.max_version {
            return Err(ChannelError::InvalidConfig(format!(
                "invalid protocol version range {}..={}",
                self.min_version, self.max_version
            )));
        }
        if self.suites.is_empty() {
            return Err(ChannelError::InvalidConfig(
                "at least one cipher suite is required".to_string(),
            ));
        }
        if self.record_size < BLOCK_SIZE
            || self.record_size > MAX_RECORD_SIZE
            || self.record_size % BLOCK_SIZE != 0
        {
            return Err(ChannelError::InvalidConfig(format!(
                "record size {} must be a multiple of {} between {} and {}",
                self.record_size, BLOCK_SIZE, BLOCK_SIZE, MAX_RECORD_SIZE
            )));
        }
        if self.renegotiate_after_bytes == Some(0) || self.renegotiate_after_secs == Some(0) {
            return Err(ChannelError::InvalidConfig(
                "renegotiation thresholds must be positive".to_string(),
            ));
        }
        if self.handshake_step_timeout_secs == 0 || self.renegotiation_timeout_secs == 0 {
            return Err(ChannelError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Config speaking exactly the versions `min..=max`.
    pub fn with_versions(min_version: u8, max_version: u8) -> Self {
        Self {
            min_version,
            max_version,
            ..Default::default()
        }
    }

    /// Highest supported version not above `offered`.
    pub fn negotiate_version(&self, offered: u8) -> Option<u8> {
        let version = offered.min(self.max_version);
        (version >= self.min_version).then_some(version)
    }

    /// Whether `version` is one this side speaks.
    pub fn supports_version(&self, version: u8) -> bool {
        (self.min_version..=self.max_version).contains(&version)
    }

    /// Payload bytes that fit in one record.
    pub fn record_payload_capacity(&self) -> usize {
        self.record_size - crate::channel::record::HEADER_SIZE
    }

    pub fn handshake_step_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_step_timeout_secs)
    }

    pub fn renegotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.renegotiation_timeout_secs)
    }

    pub fn renegotiation_interval(&self) -> Option<Duration> {
        self.renegotiate_after_secs.map(Duration::from_secs)
    }
}
