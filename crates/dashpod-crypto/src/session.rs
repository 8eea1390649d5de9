//! Session cipher for encrypted pod exchanges.
//!
//! ChaCha20-Poly1305 AEAD keyed with the negotiated session cipher key. The
//! nonce is never random: it is built from the negotiated nonce prefix and
//! the transport's nonce sequence, with the top bit of the sequence word
//! marking the direction so a request and its response share one sequence
//! value without sharing a nonce.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::CryptoError;

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 12;

/// Size of the negotiated nonce prefix.
pub const NONCE_PREFIX_SIZE: usize = 8;

/// Poly1305 authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Size of the session cipher key.
pub const CIPHER_KEY_SIZE: usize = 32;

/// Highest usable nonce sequence; bit 31 is the direction flag.
pub const MAX_NONCE_SEQUENCE: u32 = 0x7FFF_FFFF;

const DIRECTION_BIT: u32 = 0x8000_0000;

/// Which side produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Controller → pod (requests).
    ToPod,
    /// Pod → controller (responses).
    ToController,
}

/// Build the 12-byte nonce for one frame.
///
/// Layout: [8-byte prefix] [4-byte big-endian (direction << 31 | sequence)]
pub fn build_nonce(
    prefix: &[u8; NONCE_PREFIX_SIZE],
    nonce_sequence: u32,
    direction: Direction,
) -> Result<[u8; NONCE_SIZE], CryptoError> {
    if nonce_sequence > MAX_NONCE_SEQUENCE {
        return Err(CryptoError::NonceExhausted);
    }
    let word = match direction {
        Direction::ToPod => nonce_sequence,
        Direction::ToController => nonce_sequence | DIRECTION_BIT,
    };
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&word.to_be_bytes());
    Ok(nonce)
}

/// AEAD context for one negotiated session.
///
/// Stateless with respect to sequencing: the caller owns the nonce sequence
/// and decides when it advances.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl SessionCipher {
    pub fn new(key: &[u8; CIPHER_KEY_SIZE], nonce_prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce_prefix,
        }
    }

    /// Encrypt `plaintext`, authenticating `aad` alongside it.
    ///
    /// Returns ciphertext with the 16-byte tag appended.
    pub fn seal(
        &self,
        nonce_sequence: u32,
        direction: Direction,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = build_nonce(&self.nonce_prefix, nonce_sequence, direction)?;
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt and authenticate `ciphertext` (tag included).
    pub fn open(
        &self,
        nonce_sequence: u32,
        direction: Direction,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "ciphertext shorter than tag ({} bytes)",
                ciphertext.len()
            )));
        }
        let nonce_bytes = build_nonce(&self.nonce_prefix, nonce_sequence, direction)?;
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
