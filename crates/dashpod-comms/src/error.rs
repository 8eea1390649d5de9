//! Pod communications error types.

use dashpod_core::{BlockType, ConstantMismatch, FaultInfo};
use dashpod_crypto::CryptoError;

use crate::link::LinkError;
use crate::store::StoreError;

/// Result type alias using [`PodCommsError`].
pub type Result<T> = std::result::Result<T, PodCommsError>;

/// Errors surfaced by the communications core.
///
/// Nothing here is retried automatically; the caller decides whether to
/// re-attempt an operation or start pairing over.
#[derive(Debug, thiserror::Error)]
pub enum PodCommsError {
    #[error("No pod peripheral available")]
    NoPeripheralAvailable,

    #[error("Pod is not paired")]
    NotPaired,

    #[error("Pod reported address {found:#010x}, expected {expected:#010x}")]
    AddressMismatch { found: u32, expected: u32 },

    #[error("Pod fault: {0}")]
    PodFault(FaultInfo),

    #[error("Unexpected response block: {block_type:?}")]
    UnexpectedResponse { block_type: Option<BlockType> },

    #[error("Pod activation time exceeded")]
    ActivationTimeExceeded,

    #[error("Pod is incompatible: {}", join_mismatches(.mismatches))]
    Incompatible { mismatches: Vec<ConstantMismatch> },

    #[error("Response failed authentication")]
    DecryptionFailed,

    #[error("Sequence number resynchronization failed")]
    ResynchronizationFailed,

    #[error("Invalid persisted pod state: {0}")]
    InvalidPersistedState(String),

    #[error("Communication error: {0}")]
    CommsError(String),

    #[error("No response from pod")]
    NoResponse,

    #[error("Pairing key confirmation failed")]
    KeyConfirmationFailed,

    #[error("Pod failed authentication: {0}")]
    AuthenticationFailed(&'static str),

    /// A state write failed mid-session; the session's counters are no
    /// longer backed by durable state.
    #[error("Session aborted after a failed state write")]
    SessionAborted,

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Malformed frame: {0}")]
    Codec(#[from] dashpod_core::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

fn join_mismatches(mismatches: &[ConstantMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<LinkError> for PodCommsError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NoResponse => Self::NoResponse,
            LinkError::NoPeripheral => Self::NoPeripheralAvailable,
            LinkError::Disconnected(reason) => Self::CommsError(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_errors_map_onto_taxonomy() {
        assert!(matches!(
            PodCommsError::from(LinkError::NoResponse),
            PodCommsError::NoResponse
        ));
        assert!(matches!(
            PodCommsError::from(LinkError::NoPeripheral),
            PodCommsError::NoPeripheralAvailable
        ));
        assert!(matches!(
            PodCommsError::from(LinkError::Disconnected("peer reset".into())),
            PodCommsError::CommsError(reason) if reason == "peer reset"
        ));
    }

    #[test]
    fn incompatible_lists_every_mismatch() {
        let err = PodCommsError::Incompatible {
            mismatches: vec![
                ConstantMismatch {
                    field: "pulse_volume_mu",
                    expected: 50,
                    found: 40,
                },
                ConstantMismatch {
                    field: "service_duration_hours",
                    expected: 80,
                    found: 72,
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Pod is incompatible: pulse_volume_mu: expected 50, found 40; \
             service_duration_hours: expected 80, found 72"
        );
    }

    #[test]
    fn address_mismatch_formats_hex() {
        let err = PodCommsError::AddressMismatch {
            found: 0x1F08_A3C3,
            expected: 0x1F08_A3C2,
        };
        assert_eq!(
            err.to_string(),
            "Pod reported address 0x1f08a3c3, expected 0x1f08a3c2"
        );
    }
}
