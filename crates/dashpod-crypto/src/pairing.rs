//! Long-term key derivation and key confirmation for pairing.
//!
//! Both sides contribute an X25519 public key and a 16-byte nonce. The LTK is
//! HKDF-SHA256 over the ECDH output, salted with both nonces and bound to
//! both public keys. Each side then proves possession of the LTK with a
//! role-specific confirmation tag.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::exchange::{PUBLIC_KEY_SIZE, SharedSecret};

/// Size of the long-term key.
pub const LTK_SIZE: usize = 16;

/// Size of each side's pairing nonce.
pub const PAIRING_NONCE_SIZE: usize = 16;

/// Size of a key confirmation tag.
pub const CONFIRMATION_TAG_SIZE: usize = 16;

const LTK_INFO: &[u8] = b"dashpod-ltk-v1";
const CONFIRM_INFO: &[u8] = b"dashpod-confirm-v1";

/// Which side computed a confirmation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Controller = 1,
    Pod = 2,
}

/// Public values exchanged during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTranscript {
    pub controller_public: [u8; PUBLIC_KEY_SIZE],
    pub pod_public: [u8; PUBLIC_KEY_SIZE],
    pub controller_nonce: [u8; PAIRING_NONCE_SIZE],
    pub pod_nonce: [u8; PAIRING_NONCE_SIZE],
}

/// Derive the long-term key from the ECDH output and the pairing transcript.
pub fn derive_long_term_key(
    shared: &SharedSecret,
    transcript: &PairingTranscript,
) -> Result<[u8; LTK_SIZE], CryptoError> {
    let mut salt = [0u8; 2 * PAIRING_NONCE_SIZE];
    salt[..PAIRING_NONCE_SIZE].copy_from_slice(&transcript.controller_nonce);
    salt[PAIRING_NONCE_SIZE..].copy_from_slice(&transcript.pod_nonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut ltk = [0u8; LTK_SIZE];
    hk.expand_multi_info(
        &[
            LTK_INFO,
            &transcript.controller_public,
            &transcript.pod_public,
        ],
        &mut ltk,
    )
    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(ltk)
}

/// Compute the confirmation tag `role` sends to prove it holds `ltk`.
pub fn confirmation_tag(
    ltk: &[u8; LTK_SIZE],
    role: Role,
    transcript: &PairingTranscript,
) -> Result<[u8; CONFIRMATION_TAG_SIZE], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ltk);
    let mut tag = [0u8; CONFIRMATION_TAG_SIZE];
    hk.expand_multi_info(
        &[
            CONFIRM_INFO,
            &[role as u8],
            &transcript.controller_public,
            &transcript.pod_public,
            &transcript.controller_nonce,
            &transcript.pod_nonce,
        ],
        &mut tag,
    )
    .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(tag)
}

/// Check a peer's confirmation tag in constant time.
pub fn verify_confirmation(
    ltk: &[u8; LTK_SIZE],
    role: Role,
    transcript: &PairingTranscript,
    tag: &[u8],
) -> Result<(), CryptoError> {
    let expected = confirmation_tag(ltk, role, transcript)?;
    if bool::from(expected.as_slice().ct_eq(tag)) {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailed("pairing confirmation tag"))
    }
}
