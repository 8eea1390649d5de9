//! Long-term key exchange with an unpaired pod.
//!
//! 1. `Hello` to the broadcast address, answered by `Ack`.
//! 2. `PairingKey` swap with the pod's candidate address. The reply's source
//!    is the pod's self-reported address and must match the candidate.
//! 3. `PairingConfirm` swap proving both sides derived the same key.
//!
//! Running this against a pod that is already paired would derive a key the
//! pod does not hold; the orchestrator only calls it from `NotPaired`.

use std::time::Duration;

use dashpod_core::codec::{Ack, Hello, PairingConfirm, PairingKey};
use dashpod_core::ids::BROADCAST_ADDRESS;
use dashpod_core::{Ids, LongTermKey};
use dashpod_crypto::{
    KeySource, PAIRING_NONCE_SIZE, PairingTranscript, Role, compute_shared_secret,
    confirmation_tag, derive_long_term_key, verify_confirmation,
};
use tracing::{debug, info};

use crate::error::{PodCommsError, Result};
use crate::link::PodLink;
use crate::transport::MessageTransport;

/// Result of a successful pairing.
#[derive(Debug)]
pub struct PairingOutcome {
    pub address: u32,
    pub long_term_key: LongTermKey,
    /// Framing sequence to continue with on the plain transport.
    pub msg_sequence: u8,
}

/// Runs the pairing handshake for one controller/pod address pair.
pub struct LtkExchanger<'a> {
    ids: Ids,
    keys: &'a dyn KeySource,
    timeout: Duration,
}

impl<'a> LtkExchanger<'a> {
    pub const fn new(ids: Ids, keys: &'a dyn KeySource, timeout: Duration) -> Self {
        Self { ids, keys, timeout }
    }

    pub async fn negotiate<L: PodLink>(&self, link: &mut L) -> Result<PairingOutcome> {
        let expected = self.ids.pod();
        let mut transport =
            MessageTransport::plain(self.ids.controller(), BROADCAST_ADDRESS, 0, self.timeout);

        let _: Ack = transport
            .exchange(
                link,
                &Hello {
                    controller_address: self.ids.controller(),
                },
            )
            .await?;
        debug!("Pod acknowledged hello");

        let key_pair = self.keys.generate_key_pair();
        let mut controller_nonce = [0u8; PAIRING_NONCE_SIZE];
        self.keys.fill_random(&mut controller_nonce);

        transport.set_destination(expected);
        let pod_key: PairingKey = transport
            .exchange(
                link,
                &PairingKey {
                    public_key: key_pair.public_bytes(),
                    nonce: controller_nonce,
                },
            )
            .await?;

        let transcript = PairingTranscript {
            controller_public: key_pair.public_bytes(),
            pod_public: pod_key.public_key,
            controller_nonce,
            pod_nonce: pod_key.nonce,
        };
        let shared = compute_shared_secret(&key_pair, &pod_key.public_key)?;
        let ltk = derive_long_term_key(&shared, &transcript)?;

        let pod_confirm: PairingConfirm = transport
            .exchange(
                link,
                &PairingConfirm {
                    tag: confirmation_tag(&ltk, Role::Controller, &transcript)?,
                },
            )
            .await?;
        verify_confirmation(&ltk, Role::Pod, &transcript, &pod_confirm.tag)
            .map_err(|_| PodCommsError::KeyConfirmationFailed)?;

        info!(
            address = %format_args!("{expected:#010x}"),
            "Long-term key established"
        );
        Ok(PairingOutcome {
            address: expected,
            long_term_key: LongTermKey::new(ltk),
            msg_sequence: transport.msg_sequence(),
        })
    }
}
