//! AKA-style challenge/response for session key agreement.
//!
//! Every value is an HKDF-SHA256 expansion of the long-term key salted with
//! the controller's random challenge:
//!
//! - `AUTN = (SQN ^ AK) || MAC(SQN)` proves the challenge came from an LTK
//!   holder and carries the controller's 48-bit sequence number.
//! - `RES` proves the pod holds the LTK.
//! - `CK` is the session cipher key.
//! - `AUTS = (SQN_pod ^ AK*) || MAC-S(SQN_pod)` is the pod's
//!   resynchronization token when the controller's counter is behind.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::pairing::LTK_SIZE;
use crate::session::CIPHER_KEY_SIZE;

/// Size of the random challenge.
pub const RAND_SIZE: usize = 16;

/// Size of the masked sequence number.
pub const SQN_SIZE: usize = 6;

/// Size of the MAC inside AUTN/AUTS.
pub const MAC_SIZE: usize = 8;

/// Size of AUTN and AUTS tokens.
pub const TOKEN_SIZE: usize = SQN_SIZE + MAC_SIZE;

/// Size of the pod's challenge response.
pub const RES_SIZE: usize = 8;

/// Size of each side's contribution to the nonce prefix.
pub const IV_SIZE: usize = 4;

/// Largest sequence number representable in the 48-bit SQN field.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

const INFO_PREFIX: &[u8] = b"dashpod-aka-v1/";

fn kdf<const N: usize>(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    label: &[u8],
    data: &[u8],
) -> Result<[u8; N], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(rand), ltk);
    let mut out = [0u8; N];
    hk.expand_multi_info(&[INFO_PREFIX, label, data], &mut out)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(out)
}

fn sqn_bytes(sqn: u64) -> Result<[u8; SQN_SIZE], CryptoError> {
    if sqn > MAX_SEQUENCE_NUMBER {
        return Err(CryptoError::SequenceNumberOutOfRange(sqn));
    }
    let mut out = [0u8; SQN_SIZE];
    out.copy_from_slice(&sqn.to_be_bytes()[2..]);
    Ok(out)
}

fn sqn_from_bytes(bytes: &[u8; SQN_SIZE]) -> u64 {
    let mut wide = [0u8; 8];
    wide[2..].copy_from_slice(bytes);
    u64::from_be_bytes(wide)
}

fn seal_sqn(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    sqn: u64,
    mask_label: &[u8],
    mac_label: &[u8],
) -> Result<[u8; TOKEN_SIZE], CryptoError> {
    let plain = sqn_bytes(sqn)?;
    let mask: [u8; SQN_SIZE] = kdf(ltk, rand, mask_label, &[])?;
    let mac: [u8; MAC_SIZE] = kdf(ltk, rand, mac_label, &plain)?;

    let mut token = [0u8; TOKEN_SIZE];
    for (i, b) in plain.iter().enumerate() {
        token[i] = b ^ mask[i];
    }
    token[SQN_SIZE..].copy_from_slice(&mac);
    Ok(token)
}

fn open_sqn(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    token: &[u8],
    mask_label: &[u8],
    mac_label: &[u8],
    what: &'static str,
) -> Result<u64, CryptoError> {
    if token.len() != TOKEN_SIZE {
        return Err(CryptoError::AuthenticationFailed(what));
    }
    let mask: [u8; SQN_SIZE] = kdf(ltk, rand, mask_label, &[])?;
    let mut plain = [0u8; SQN_SIZE];
    for (i, b) in token[..SQN_SIZE].iter().enumerate() {
        plain[i] = b ^ mask[i];
    }
    let mac: [u8; MAC_SIZE] = kdf(ltk, rand, mac_label, &plain)?;
    if bool::from(mac.as_slice().ct_eq(&token[SQN_SIZE..])) {
        Ok(sqn_from_bytes(&plain))
    } else {
        Err(CryptoError::AuthenticationFailed(what))
    }
}

/// Build the controller's AUTN for `sqn`.
pub fn authentication_token(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    sqn: u64,
) -> Result<[u8; TOKEN_SIZE], CryptoError> {
    seal_sqn(ltk, rand, sqn, b"ak", b"mac")
}

/// Verify an AUTN and recover the controller's sequence number (pod side).
pub fn open_authentication_token(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    autn: &[u8],
) -> Result<u64, CryptoError> {
    open_sqn(ltk, rand, autn, b"ak", b"mac", "challenge authentication token")
}

/// Build the pod's AUTS carrying its own sequence number.
pub fn resynchronization_token(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    pod_sqn: u64,
) -> Result<[u8; TOKEN_SIZE], CryptoError> {
    seal_sqn(ltk, rand, pod_sqn, b"ak*", b"mac-s")
}

/// Verify an AUTS and recover the pod's sequence number.
pub fn open_resynchronization_token(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    auts: &[u8],
) -> Result<u64, CryptoError> {
    open_sqn(ltk, rand, auts, b"ak*", b"mac-s", "resynchronization token")
}

/// The response a genuine pod returns for `rand`.
pub fn challenge_response(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
) -> Result<[u8; RES_SIZE], CryptoError> {
    kdf(ltk, rand, b"res", &[])
}

/// Check the pod's challenge response in constant time.
pub fn verify_challenge_response(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
    res: &[u8],
) -> Result<(), CryptoError> {
    let expected = challenge_response(ltk, rand)?;
    if bool::from(expected.as_slice().ct_eq(res)) {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailed("challenge response"))
    }
}

/// Session cipher key for the session opened by `rand`.
///
/// **Note:** The caller is responsible for zeroizing the returned key bytes.
pub fn session_cipher_key(
    ltk: &[u8; LTK_SIZE],
    rand: &[u8; RAND_SIZE],
) -> Result<[u8; CIPHER_KEY_SIZE], CryptoError> {
    kdf(ltk, rand, b"ck", &[])
}
