//! Key agreement primitive.
//!
//! X25519 keypairs and shared-secret computation used by the pairing
//! exchange. Private keys always come from a [`KeySource`]; production code
//! uses [`OsKeySource`], the fixed-output source only exists for tests.

use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 keypair.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct from raw 32-byte secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        arr.zeroize();
        Ok(Self { secret, public })
    }

    /// Get the public key as raw bytes.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }
}

/// Raw X25519 output. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// Generate a fresh keypair from the OS RNG.
pub fn generate_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// Compute the X25519 shared secret between our keypair and a peer public key.
///
/// Fails with [`CryptoError::InvalidKeyMaterial`] when the peer key has the
/// wrong length or is a low-order point (non-contributory exchange).
pub fn compute_shared_secret(
    local: &KeyPair,
    peer_public: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let arr: [u8; PUBLIC_KEY_SIZE] = peer_public.try_into().map_err(|_| {
        CryptoError::InvalidKeyMaterial(format!(
            "peer public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            peer_public.len()
        ))
    })?;
    let shared = local.secret.diffie_hellman(&PublicKey::from(arr));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKeyMaterial(
            "peer public key is a low-order point".into(),
        ));
    }
    Ok(SharedSecret(*shared.as_bytes()))
}

/// Source of private keys and protocol randomness (nonces, challenges, IVs).
pub trait KeySource: Send + Sync {
    fn generate_key_pair(&self) -> KeyPair;
    fn fill_random(&self, buf: &mut [u8]);
}

/// Cryptographically secure source backed by the OS RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn generate_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Fixed-output source for deterministic tests. Never wire this into
/// production code.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Clone, Copy)]
pub struct FixedKeySource {
    secret: [u8; 32],
    fill_byte: u8,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedKeySource {
    pub const fn new(secret: [u8; 32], fill_byte: u8) -> Self {
        Self { secret, fill_byte }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl KeySource for FixedKeySource {
    fn generate_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::from(self.secret);
        let public = PublicKey::from(&secret);
        KeyPair { secret, public }
    }

    fn fill_random(&self, buf: &mut [u8]) {
        buf.fill(self.fill_byte);
    }
}
