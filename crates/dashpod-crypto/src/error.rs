//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Authentication token did not verify: {0}")]
    AuthenticationFailed(&'static str),

    #[error("Sequence number {0} does not fit in 48 bits")]
    SequenceNumberOutOfRange(u64),

    #[error("Nonce sequence exhausted, session must be rekeyed")]
    NonceExhausted,
}
