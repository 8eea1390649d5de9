//! Framed request/response exchange with a pod.
//!
//! A transport is either plain (pairing, setup and key agreement) or bound
//! to negotiated session keys. Each [`MessageTransport::send`] is one round
//! trip; `&mut self` keeps a second send from starting before the first
//! finishes.
//!
//! Counters move only when a response arrives. The request and its response
//! echo the same message sequence and share one nonce sequence value (the
//! direction bit separates their nonces), after which both counters step by
//! one.

use std::time::Duration;

use dashpod_core::codec::{
    BlockPayload, FrameHeader, HEADER_SIZE, MAX_SEQUENCE, decode_blocks, encode_blocks,
    encode_frame, split_frame,
};
use dashpod_core::ids::BROADCAST_ADDRESS;
use dashpod_core::{
    BlockType, CipherKey, FaultInfo, Message, MessageBlock, MessageTransportState,
};
use dashpod_crypto::{Direction, SessionCipher, TAG_SIZE};
use tracing::{debug, warn};

use crate::error::{PodCommsError, Result};
use crate::link::{PodLink, round_trip};

struct SessionContext {
    cipher: SessionCipher,
    cipher_key: CipherKey,
    nonce_prefix: [u8; 8],
    nonce_sequence: u32,
}

/// One side of a framed exchange with a single pod.
pub struct MessageTransport {
    source: u32,
    destination: u32,
    msg_sequence: u8,
    session: Option<SessionContext>,
    faulted: Option<FaultInfo>,
    timeout: Duration,
}

impl MessageTransport {
    /// A transport that sends unencrypted frames.
    pub const fn plain(source: u32, destination: u32, msg_sequence: u8, timeout: Duration) -> Self {
        Self {
            source,
            destination,
            msg_sequence: msg_sequence & MAX_SEQUENCE,
            session: None,
            faulted: None,
            timeout,
        }
    }

    /// A transport bound to negotiated session keys.
    pub fn encrypted(
        source: u32,
        destination: u32,
        state: &MessageTransportState,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            destination,
            msg_sequence: state.msg_sequence & MAX_SEQUENCE,
            session: Some(SessionContext {
                cipher: SessionCipher::new(state.cipher_key.as_bytes(), state.nonce_prefix),
                cipher_key: state.cipher_key.clone(),
                nonce_prefix: state.nonce_prefix,
                nonce_sequence: state.nonce_sequence,
            }),
            faulted: None,
            timeout,
        }
    }

    pub const fn msg_sequence(&self) -> u8 {
        self.msg_sequence
    }

    pub(crate) const fn set_destination(&mut self, destination: u32) {
        self.destination = destination;
    }

    /// The fault that latched this transport, if any.
    pub const fn fault(&self) -> Option<FaultInfo> {
        self.faulted
    }

    /// Current session counters; `None` for a plain transport.
    pub fn transport_state(&self) -> Option<MessageTransportState> {
        self.session.as_ref().map(|s| MessageTransportState {
            cipher_key: s.cipher_key.clone(),
            nonce_prefix: s.nonce_prefix,
            msg_sequence: self.msg_sequence,
            nonce_sequence: s.nonce_sequence,
        })
    }

    /// Send `blocks` and return the pod's response.
    ///
    /// A response carrying a fault block latches the transport: this call
    /// and every later one fail with `PodFault`, the later ones without
    /// touching the link.
    pub async fn send<L: PodLink>(
        &mut self,
        link: &mut L,
        blocks: Vec<MessageBlock>,
    ) -> Result<Message> {
        if let Some(fault) = self.faulted {
            return Err(PodCommsError::PodFault(fault));
        }

        let sequence = self.msg_sequence;
        let request = self.seal(sequence, &blocks)?;
        debug!(
            destination = %format_args!("{:#010x}", self.destination),
            sequence,
            nonce_sequence = self.session.as_ref().map(|s| s.nonce_sequence),
            blocks = blocks.len(),
            "Sending message"
        );

        let raw = round_trip(link, &request, self.timeout).await?;

        // The request went out under this nonce and the pod answered, so the
        // nonce is spent whatever the response turns out to be.
        let response = self.open(&raw);
        self.advance();
        let response = response?;

        if response.destination != self.source {
            return Err(PodCommsError::CommsError(format!(
                "response addressed to {:#010x}, expected {:#010x}",
                response.destination, self.source
            )));
        }
        if self.destination != BROADCAST_ADDRESS && response.source != self.destination {
            return Err(PodCommsError::AddressMismatch {
                found: response.source,
                expected: self.destination,
            });
        }
        if response.sequence != sequence {
            return Err(PodCommsError::CommsError(format!(
                "response sequence {} does not echo request {sequence}",
                response.sequence
            )));
        }

        // Latch on the block type alone; a garbled report is still a fault.
        if let Some(fault) = response.fault() {
            warn!(%fault, "Pod reported a fault");
            self.faulted = Some(fault);
            return Err(PodCommsError::PodFault(fault));
        }
        Ok(response)
    }

    /// Send and require the response's leading block to be `expected`.
    pub async fn send_expecting<L: PodLink>(
        &mut self,
        link: &mut L,
        blocks: Vec<MessageBlock>,
        expected: BlockType,
    ) -> Result<Message> {
        let response = self.send(link, blocks).await?;
        match response.leading_block_type() {
            Some(found) if found == expected => Ok(response),
            found => Err(PodCommsError::UnexpectedResponse { block_type: found }),
        }
    }

    /// Send one typed request block and decode the typed response block.
    pub async fn exchange<L, Req, Resp>(&mut self, link: &mut L, request: &Req) -> Result<Resp>
    where
        L: PodLink,
        Req: BlockPayload,
        Resp: BlockPayload,
    {
        let response = self
            .send_expecting(link, vec![request.to_block()], Resp::BLOCK_TYPE)
            .await?;
        match response.blocks.first() {
            Some(block) => Ok(Resp::from_block(block)?),
            None => Err(PodCommsError::UnexpectedResponse { block_type: None }),
        }
    }

    fn seal(&self, sequence: u8, blocks: &[MessageBlock]) -> Result<Vec<u8>> {
        let body = encode_blocks(blocks)?;
        match &self.session {
            None => {
                let header =
                    FrameHeader::new(false, sequence, body.len(), self.source, self.destination)?;
                Ok(encode_frame(&header, &body)?)
            }
            Some(session) => {
                let header = FrameHeader::new(
                    true,
                    sequence,
                    body.len() + TAG_SIZE,
                    self.source,
                    self.destination,
                )?;
                let sealed = session.cipher.seal(
                    session.nonce_sequence,
                    Direction::ToPod,
                    &header.encode(),
                    &body,
                )?;
                Ok(encode_frame(&header, &sealed)?)
            }
        }
    }

    fn open(&self, raw: &[u8]) -> Result<Message> {
        let (header, body) = split_frame(raw)?;
        let blocks = match (&self.session, header.encrypted) {
            (None, false) => decode_blocks(body)?,
            (None, true) => return Err(dashpod_core::Error::EncryptedFrame.into()),
            (Some(_), false) => {
                warn!("Unencrypted response on an encrypted session");
                return Err(PodCommsError::DecryptionFailed);
            }
            (Some(session), true) => {
                let plaintext = session
                    .cipher
                    .open(
                        session.nonce_sequence,
                        Direction::ToController,
                        &raw[..HEADER_SIZE],
                        body,
                    )
                    .map_err(|e| {
                        warn!(
                            error = %e,
                            nonce_sequence = session.nonce_sequence,
                            "Response failed authentication"
                        );
                        PodCommsError::DecryptionFailed
                    })?;
                decode_blocks(&plaintext)?
            }
        };
        Ok(Message {
            source: header.source,
            destination: header.destination,
            sequence: header.sequence,
            blocks,
        })
    }

    fn advance(&mut self) {
        self.msg_sequence = (self.msg_sequence + 1) & MAX_SEQUENCE;
        if let Some(session) = self.session.as_mut() {
            session.nonce_sequence += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use dashpod_core::codec::{Ack, AssignAddress, encode_message};
    use dashpod_crypto::build_nonce;

    use crate::link::LinkError;

    const CONTROLLER: u32 = 0x0000_1092;
    const POD: u32 = 0x1F08_A3C2;
    const KEY: [u8; 32] = [0x42; 32];
    const PREFIX: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
    const TIMEOUT: Duration = Duration::from_secs(1);

    type Respond = Box<dyn FnMut(&[u8]) -> std::result::Result<Vec<u8>, LinkError> + Send>;

    struct FnLink {
        respond: Respond,
        calls: usize,
    }

    impl FnLink {
        fn new(
            respond: impl FnMut(&[u8]) -> std::result::Result<Vec<u8>, LinkError> + Send + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                calls: 0,
            }
        }
    }

    impl PodLink for FnLink {
        async fn send_and_await_response(
            &mut self,
            frame: &[u8],
        ) -> std::result::Result<Vec<u8>, LinkError> {
            self.calls += 1;
            (self.respond)(frame)
        }
    }

    fn session_state() -> MessageTransportState {
        MessageTransportState {
            cipher_key: CipherKey::new(KEY),
            nonce_prefix: PREFIX,
            msg_sequence: 1,
            nonce_sequence: 0,
        }
    }

    /// Pod side of an encrypted exchange: authenticate the request under
    /// `nonce_sequence` and answer under the same value.
    fn pod_reply(request: &[u8], nonce_sequence: u32, blocks: &[MessageBlock]) -> Vec<u8> {
        let cipher = SessionCipher::new(&KEY, PREFIX);
        let (header, body) = split_frame(request).unwrap();
        cipher
            .open(nonce_sequence, Direction::ToPod, &request[..HEADER_SIZE], body)
            .unwrap();
        let plain = encode_blocks(blocks).unwrap();
        let reply = FrameHeader::new(
            true,
            header.sequence,
            plain.len() + TAG_SIZE,
            header.destination,
            header.source,
        )
        .unwrap();
        let sealed = cipher
            .seal(nonce_sequence, Direction::ToController, &reply.encode(), &plain)
            .unwrap();
        encode_frame(&reply, &sealed).unwrap()
    }

    fn plain_reply(request: &[u8], source: u32, blocks: Vec<MessageBlock>) -> Vec<u8> {
        let (header, _) = split_frame(request).unwrap();
        encode_message(&Message::new(source, header.source, header.sequence, blocks).unwrap())
            .unwrap()
    }

    fn assign() -> Vec<MessageBlock> {
        vec![AssignAddress { address: POD }.to_block()]
    }

    #[tokio::test]
    async fn first_encrypted_send_uses_nonce_zero_and_advances_to_one() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_pod = seen.clone();
        let mut link = FnLink::new(move |frame| {
            seen_by_pod.lock().unwrap().push(frame.to_vec());
            Ok(pod_reply(frame, 0, &[Ack.to_block()]))
        });
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        transport.send(&mut link, assign()).await.unwrap();

        let state = transport.transport_state().unwrap();
        assert_eq!(state.nonce_sequence, 1);
        assert_eq!(state.msg_sequence, 2);

        // The request is sealed under prefix P and sequence word 0.
        let frame = seen.lock().unwrap()[0].clone();
        let nonce = build_nonce(&PREFIX, 0, Direction::ToPod).unwrap();
        assert_eq!(&nonce[..8], &PREFIX);
        assert_eq!(&nonce[8..], &[0, 0, 0, 0]);
        let (header, _) = split_frame(&frame).unwrap();
        assert!(header.encrypted);
        assert_eq!(header.sequence, 1);
    }

    #[tokio::test]
    async fn nonce_sequence_steps_by_one_per_round_trip() {
        let pod_counter = Arc::new(Mutex::new(0u32));
        let counter = pod_counter.clone();
        let mut link = FnLink::new(move |frame| {
            let mut n = counter.lock().unwrap();
            let reply = pod_reply(frame, *n, &[Ack.to_block()]);
            *n += 1;
            Ok(reply)
        });
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let mut previous = transport.transport_state().unwrap().nonce_sequence;
        for _ in 0..20 {
            transport.send(&mut link, assign()).await.unwrap();
            let now = transport.transport_state().unwrap().nonce_sequence;
            assert_eq!(now, previous + 1);
            previous = now;
        }
        assert_eq!(*pod_counter.lock().unwrap(), 20);
        // 4-bit framing sequence wrapped along the way.
        assert_eq!(transport.msg_sequence(), (1 + 20) & MAX_SEQUENCE);
    }

    #[tokio::test]
    async fn fault_latches_transport() {
        let fault = FaultInfo {
            code: 0x31,
            pod_progress: 8,
            minutes_since_activation: 95,
        };
        let mut link = FnLink::new(move |frame| Ok(pod_reply(frame, 0, &[fault.to_block()])));
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let first = transport.send(&mut link, assign()).await;
        assert!(matches!(first, Err(PodCommsError::PodFault(f)) if f == fault));
        assert_eq!(link.calls, 1);

        let second = transport.send(&mut link, assign()).await;
        assert!(matches!(second, Err(PodCommsError::PodFault(_))));
        assert_eq!(link.calls, 1, "a latched transport must not touch the link");
        assert_eq!(transport.fault(), Some(fault));
    }

    #[tokio::test]
    async fn short_fault_block_still_latches() {
        let mut link = FnLink::new(|frame| {
            Ok(pod_reply(frame, 0, &[MessageBlock::new(0x02, vec![0x31, 0x08])]))
        });
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let first = transport.send(&mut link, assign()).await;
        assert!(matches!(first, Err(PodCommsError::PodFault(f)) if f.code == 0x31));

        let second = transport.send(&mut link, assign()).await;
        assert!(matches!(second, Err(PodCommsError::PodFault(f)) if f.code == 0x31));
        assert_eq!(link.calls, 1);
        assert_eq!(transport.transport_state().unwrap().nonce_sequence, 1);
    }

    #[tokio::test]
    async fn tampered_response_fails_authentication() {
        let mut link = FnLink::new(|frame| {
            let mut reply = pod_reply(frame, 0, &[Ack.to_block()]);
            let last = reply.len() - 1;
            reply[last] ^= 0x01;
            Ok(reply)
        });
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let result = transport.send(&mut link, assign()).await;
        assert!(matches!(result, Err(PodCommsError::DecryptionFailed)));
        // The nonce was spent on the wire and is never reused.
        assert_eq!(transport.transport_state().unwrap().nonce_sequence, 1);
    }

    #[tokio::test]
    async fn plaintext_reply_on_encrypted_session_is_rejected() {
        let mut link = FnLink::new(|frame| Ok(plain_reply(frame, POD, vec![Ack.to_block()])));
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let result = transport.send(&mut link, assign()).await;
        assert!(matches!(result, Err(PodCommsError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn unacknowledged_send_does_not_advance() {
        let mut link = FnLink::new(|_| Err(LinkError::NoResponse));
        let mut transport = MessageTransport::encrypted(CONTROLLER, POD, &session_state(), TIMEOUT);

        let result = transport.send(&mut link, assign()).await;
        assert!(matches!(result, Err(PodCommsError::NoResponse)));
        assert_eq!(transport.transport_state().unwrap(), session_state());
    }

    #[tokio::test]
    async fn unexpected_leading_block_is_reported() {
        let mut link = FnLink::new(|frame| Ok(plain_reply(frame, POD, vec![Ack.to_block()])));
        let mut transport = MessageTransport::plain(CONTROLLER, POD, 0, TIMEOUT);

        let result = transport
            .send_expecting(&mut link, assign(), BlockType::VersionResponse)
            .await;
        assert!(matches!(
            result,
            Err(PodCommsError::UnexpectedResponse {
                block_type: Some(BlockType::Ack)
            })
        ));
    }

    #[tokio::test]
    async fn plain_exchange_decodes_typed_reply() {
        let mut link = FnLink::new(|frame| Ok(plain_reply(frame, POD, vec![Ack.to_block()])));
        let mut transport = MessageTransport::plain(CONTROLLER, POD, 14, TIMEOUT);

        let _: Ack = transport
            .exchange(&mut link, &AssignAddress { address: POD })
            .await
            .unwrap();
        let _: Ack = transport
            .exchange(&mut link, &AssignAddress { address: POD })
            .await
            .unwrap();
        assert_eq!(transport.msg_sequence(), 0);
        assert!(transport.transport_state().is_none());
    }

    #[tokio::test]
    async fn reply_from_another_address_is_a_mismatch() {
        let mut link =
            FnLink::new(|frame| Ok(plain_reply(frame, POD + 1, vec![Ack.to_block()])));
        let mut transport = MessageTransport::plain(CONTROLLER, POD, 0, TIMEOUT);

        let result = transport.send(&mut link, assign()).await;
        assert!(matches!(
            result,
            Err(PodCommsError::AddressMismatch { found, expected })
                if found == POD + 1 && expected == POD
        ));
    }

    #[tokio::test]
    async fn broadcast_accepts_any_source() {
        let mut link =
            FnLink::new(|frame| Ok(plain_reply(frame, 0x0BAD_CAFE, vec![Ack.to_block()])));
        let mut transport = MessageTransport::plain(CONTROLLER, BROADCAST_ADDRESS, 0, TIMEOUT);

        let response = transport.send(&mut link, assign()).await.unwrap();
        assert_eq!(response.source, 0x0BAD_CAFE);
    }
}
