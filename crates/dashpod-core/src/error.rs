//! Error types for the dashpod core library.

use thiserror::Error;

use crate::codec::BlockType;

/// Result type alias using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types: wire codec, persisted state and configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Input ended before a complete field could be read
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Frame does not start with the protocol magic
    #[error("Bad frame magic {0:02x?}")]
    BadMagic([u8; 2]),

    /// Frame header carries a version this codec does not speak
    #[error("Unsupported frame version {0}")]
    UnsupportedVersion(u8),

    /// Declared body length disagrees with the bytes received
    #[error("Frame body length {declared} does not match {actual} bytes received")]
    LengthMismatch { declared: usize, actual: usize },

    /// Message sequence numbers are 4 bits wide
    #[error("Sequence number {0} out of range 0..=15")]
    InvalidSequence(u8),

    /// Body or block payload does not fit its 16-bit length field
    #[error("Payload of {0} bytes exceeds the 65535-byte length field")]
    PayloadTooLarge(usize),

    /// Typed block payload has the wrong size
    #[error("Block {block_type:?} payload is {actual} bytes, expected {expected}")]
    BlockLength {
        block_type: BlockType,
        expected: usize,
        actual: usize,
    },

    /// A typed decode was attempted on a block of another type
    #[error("Expected block {expected:?}, found {found:?}")]
    UnexpectedBlock { expected: BlockType, found: BlockType },

    /// Plaintext decode attempted on an encrypted frame
    #[error("Frame is encrypted")]
    EncryptedFrame,

    /// Persisted pod state is internally inconsistent
    #[error("Invalid pod state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
