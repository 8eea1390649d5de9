//! Session key agreement over the long-term key.
//!
//! The controller sends `EapChallenge{rand, AUTN, controller_iv}` where AUTN
//! carries its sequence number. A pod that accepts the number answers
//! `EapSuccess{RES, pod_iv}`; a pod whose own counter is ahead answers
//! `EapSynchronizationFailure{AUTS}` carrying that counter.

use dashpod_core::codec::{
    BlockPayload, EapChallenge, EapSuccess, EapSynchronizationFailure,
};
use dashpod_core::{BlockType, CipherKey, LongTermKey};
use dashpod_crypto::aka::{
    IV_SIZE, RAND_SIZE, authentication_token, open_resynchronization_token, session_cipher_key,
    verify_challenge_response,
};
use dashpod_crypto::{CryptoError, KeySource, NONCE_PREFIX_SIZE};
use tracing::{debug, info, warn};

use crate::error::{PodCommsError, Result};
use crate::link::PodLink;
use crate::transport::MessageTransport;

/// Keys for one encrypted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub cipher_key: CipherKey,
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    /// Framing sequence the encrypted transport starts from.
    pub msg_sequence: u8,
}

/// What one challenge/response exchange produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapOutcome {
    Established(SessionKeys),
    /// The pod's counter is ahead; it reported this value.
    ResynchronizationRequired(u64),
}

/// Result of a completed establishment.
#[derive(Debug)]
pub struct Established {
    pub keys: SessionKeys,
    /// The sequence number the successful challenge carried.
    pub sequence_number: u64,
}

/// Runs the challenge/response exchange under one long-term key.
pub struct SessionKeyEstablisher<'a> {
    ltk: &'a LongTermKey,
    keys: &'a dyn KeySource,
}

impl<'a> SessionKeyEstablisher<'a> {
    pub const fn new(ltk: &'a LongTermKey, keys: &'a dyn KeySource) -> Self {
        Self { ltk, keys }
    }

    /// One challenge carrying `sequence_number`, sent over the plain
    /// `transport` (which fixes the pod address and framing sequence).
    pub async fn exchange<L: PodLink>(
        &self,
        link: &mut L,
        transport: &mut MessageTransport,
        sequence_number: u64,
    ) -> Result<EapOutcome> {
        let ltk = self.ltk.as_bytes();
        let mut rand = [0u8; RAND_SIZE];
        let mut controller_iv = [0u8; IV_SIZE];
        self.keys.fill_random(&mut rand);
        self.keys.fill_random(&mut controller_iv);

        let challenge = EapChallenge {
            rand,
            autn: authentication_token(ltk, &rand, sequence_number)?,
            controller_iv,
        };
        let response = transport.send(link, vec![challenge.to_block()]).await?;
        let Some(block) = response.blocks.first() else {
            return Err(PodCommsError::UnexpectedResponse { block_type: None });
        };

        match block.block_type {
            BlockType::EapSuccess => {
                let success = EapSuccess::from_block(block)?;
                verify_challenge_response(ltk, &rand, &success.res).map_err(auth_failure)?;

                let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
                nonce_prefix[..IV_SIZE].copy_from_slice(&controller_iv);
                nonce_prefix[IV_SIZE..].copy_from_slice(&success.pod_iv);
                Ok(EapOutcome::Established(SessionKeys {
                    cipher_key: CipherKey::new(session_cipher_key(ltk, &rand)?),
                    nonce_prefix,
                    msg_sequence: transport.msg_sequence(),
                }))
            }
            BlockType::EapSynchronizationFailure => {
                let failure = EapSynchronizationFailure::from_block(block)?;
                let pod_sequence = open_resynchronization_token(ltk, &rand, &failure.auts)
                    .map_err(auth_failure)?;
                Ok(EapOutcome::ResynchronizationRequired(pod_sequence))
            }
            other => Err(PodCommsError::UnexpectedResponse {
                block_type: Some(other),
            }),
        }
    }

    /// Establish session keys starting from the stored counter.
    ///
    /// `record` is called with the sequence number of each attempt before
    /// the challenge is sent and must make it durable. One resynchronization
    /// is honoured; a second fails with `ResynchronizationFailed`.
    pub async fn establish<L, F>(
        &self,
        link: &mut L,
        transport: &mut MessageTransport,
        stored_sequence_number: u64,
        mut record: F,
    ) -> Result<Established>
    where
        L: PodLink,
        F: FnMut(u64) -> Result<()> + Send,
    {
        let mut stored = stored_sequence_number;
        let mut resynchronized = false;
        loop {
            let used = stored
                .checked_add(1)
                .ok_or(CryptoError::SequenceNumberOutOfRange(stored))?;
            record(used)?;
            debug!(sequence_number = used, "Sending session challenge");

            match self.exchange(link, transport, used).await? {
                EapOutcome::Established(keys) => {
                    info!(sequence_number = used, "Session keys established");
                    return Ok(Established {
                        keys,
                        sequence_number: used,
                    });
                }
                EapOutcome::ResynchronizationRequired(pod_sequence) if !resynchronized => {
                    warn!(
                        sequence_number = used,
                        pod_sequence_number = pod_sequence,
                        "Pod requested sequence number resynchronization"
                    );
                    resynchronized = true;
                    // Never step backwards, whatever the pod claims.
                    stored = pod_sequence.max(used);
                }
                EapOutcome::ResynchronizationRequired(pod_sequence) => {
                    warn!(
                        pod_sequence_number = pod_sequence,
                        "Pod requested a second resynchronization"
                    );
                    return Err(PodCommsError::ResynchronizationFailed);
                }
            }
        }
    }
}

fn auth_failure(err: CryptoError) -> PodCommsError {
    match err {
        CryptoError::AuthenticationFailed(what) => PodCommsError::AuthenticationFailed(what),
        other => PodCommsError::Crypto(other),
    }
}
