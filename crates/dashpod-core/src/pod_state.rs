//! The persisted record of one pod.
//!
//! `PodState` is plain data. Mutation rules (persist before publish, notify
//! on change) are enforced by the orchestrator in `dashpod-comms`; this
//! module only defines the shape, its JSON form and consistency checks.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::{FaultInfo, FirmwareVersion, MAX_SEQUENCE};
use crate::error::{Error, Result};

/// Size of the long-term key established at pairing.
pub const LONG_TERM_KEY_SIZE: usize = 16;

/// Size of a session cipher key.
pub const CIPHER_KEY_SIZE: usize = 32;

/// Size of the per-session nonce prefix.
pub const NONCE_PREFIX_SIZE: usize = 8;

/// Long-term key shared with a paired pod. Hex in JSON, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct LongTermKey(#[serde(with = "hex::serde")] [u8; LONG_TERM_KEY_SIZE]);

impl LongTermKey {
    pub const fn new(bytes: [u8; LONG_TERM_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; LONG_TERM_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LongTermKey([REDACTED])")
    }
}

/// Session cipher key. Hex in JSON, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct CipherKey(#[serde(with = "hex::serde")] [u8; CIPHER_KEY_SIZE]);

impl CipherKey {
    pub const fn new(bytes: [u8; CIPHER_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; CIPHER_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey([REDACTED])")
    }
}

/// Cryptographic context of the current encrypted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTransportState {
    pub cipher_key: CipherKey,
    #[serde(with = "hex::serde")]
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    /// 4-bit framing sequence, wraps 15 -> 0.
    pub msg_sequence: u8,
    /// Never repeats for one `(cipher_key, nonce_prefix)`.
    pub nonce_sequence: u32,
}

/// Pairing and provisioning phase.
///
/// Variants are declared in lifecycle order; the two terminal failures sort
/// after `Ready`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SetupProgress {
    #[default]
    NotPaired,
    PairingCompleted,
    AddressAssigned,
    PodPaired,
    Ready,
    ActivationTimeout,
    PodIncompatible,
}

impl SetupProgress {
    /// No further setup step can succeed from here.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::ActivationTimeout | Self::PodIncompatible)
    }

    /// Setup finished; only session keys remain to be derived.
    pub const fn is_provisioned(self) -> bool {
        matches!(self, Self::PodPaired | Self::Ready)
    }

    const fn requires_long_term_key(self) -> bool {
        !matches!(self, Self::NotPaired)
    }
}

impl fmt::Display for SetupProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotPaired => "not_paired",
            Self::PairingCompleted => "pairing_completed",
            Self::AddressAssigned => "address_assigned",
            Self::PodPaired => "pod_paired",
            Self::Ready => "ready",
            Self::ActivationTimeout => "activation_timeout",
            Self::PodIncompatible => "pod_incompatible",
        };
        f.write_str(s)
    }
}

/// Everything the controller knows about one pod.
///
/// Every field has a default so records written by older releases, and
/// records carrying fields this release does not know, both load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodState {
    pub address: Option<u32>,
    pub long_term_key: Option<LongTermKey>,
    pub eap_sequence_number: u64,
    pub transport_state: Option<MessageTransportState>,
    pub setup_progress: SetupProgress,
    pub fault: Option<FaultInfo>,
    pub firmware_version: Option<FirmwareVersion>,
    pub ble_firmware_version: Option<FirmwareVersion>,
    pub lot_number: Option<u32>,
    pub serial_number: Option<u32>,
}

impl PodState {
    /// A freshly discovered pod.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the invariants a loaded record must satisfy.
    pub fn validate(&self) -> Result<()> {
        let progress = self.setup_progress;
        if progress.requires_long_term_key() {
            if self.long_term_key.is_none() {
                return Err(Error::InvalidState(format!(
                    "progress {progress} without a long-term key"
                )));
            }
            if self.address.is_none() {
                return Err(Error::InvalidState(format!(
                    "progress {progress} without an address"
                )));
            }
        }
        if let Some(transport) = &self.transport_state {
            if self.long_term_key.is_none() {
                return Err(Error::InvalidState(
                    "transport state without a long-term key".into(),
                ));
            }
            if transport.msg_sequence > MAX_SEQUENCE {
                return Err(Error::InvalidState(format!(
                    "message sequence {} out of range",
                    transport.msg_sequence
                )));
            }
        } else if progress == SetupProgress::Ready {
            return Err(Error::InvalidState(
                "progress ready without a transport state".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a persisted record.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(json)?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
