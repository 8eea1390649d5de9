//! Dashpod link crypto
//!
//! Cryptographic primitives for the controller ↔ pod radio link. The pod is
//! an untrusted peripheral, so every exchange past discovery is keyed.
//!
//! ## Crypto primitives
//!
//! - **Key agreement**: X25519 ECDH, private keys from the OS RNG
//! - **Pairing**: HKDF-SHA256 long-term key + role-bound confirmation tags
//! - **Session keys**: AKA-style challenge/response over the long-term key
//! - **Encryption**: ChaCha20-Poly1305 AEAD, 12-byte nonce (8-byte negotiated prefix + 4-byte directional sequence)

pub mod aka;
pub mod error;
pub mod exchange;
pub mod pairing;
pub mod session;

pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use exchange::FixedKeySource;
pub use exchange::{
    KeyPair, KeySource, OsKeySource, PUBLIC_KEY_SIZE, SharedSecret, compute_shared_secret,
    generate_key_pair,
};
pub use pairing::{
    CONFIRMATION_TAG_SIZE, LTK_SIZE, PAIRING_NONCE_SIZE, PairingTranscript, Role,
    confirmation_tag, derive_long_term_key, verify_confirmation,
};
pub use session::{
    CIPHER_KEY_SIZE, Direction, MAX_NONCE_SEQUENCE, NONCE_PREFIX_SIZE, NONCE_SIZE, SessionCipher,
    TAG_SIZE, build_nonce,
};
