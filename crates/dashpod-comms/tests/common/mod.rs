//! A software pod and store helpers shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashpod_comms::{LinkError, MemoryStore, PodLink, PodStateStore, StoreError};
use dashpod_core::codec::{
    Ack, AssignAddress, BlockPayload, EapChallenge, EapSuccess, EapSynchronizationFailure,
    FirmwareVersion, FrameHeader, HEADER_SIZE, PairingConfirm, PairingKey, SetupPod,
    VersionResponse, decode_blocks, encode_blocks, encode_frame, encode_message, split_frame,
};
use dashpod_core::{
    BlockType, CommsConfig, FaultInfo, Message, MessageBlock, PodConstants, PodState,
    SetupProgress,
};
use dashpod_crypto::aka::{
    challenge_response, open_authentication_token, resynchronization_token, session_cipher_key,
};
use dashpod_crypto::{
    Direction, FixedKeySource, KeyPair, PairingTranscript, Role, SessionCipher, TAG_SIZE,
    compute_shared_secret, confirmation_tag, derive_long_term_key, verify_confirmation,
};

pub const CONTROLLER: u32 = 0x0000_1092;
pub const POD: u32 = 0x1F08_A3C2;
pub const LOT: u32 = 0x0001_2345;
pub const SERIAL: u32 = 0x0067_89AB;

const POD_SECRET: [u8; 32] = [0x5D; 32];
const POD_NONCE: [u8; 16] = [0xA5; 16];
const POD_IV: [u8; 4] = [0x3C; 4];

/// Opaque command code used by session bodies.
pub const COMMAND: u8 = 0x1A;

/// Pod progress after a successful address assignment and setup.
const PROGRESS_ADDRESS_ASSIGNED: u8 = 2;
const PROGRESS_SETUP_COMPLETE: u8 = 3;

/// Deterministic controller key material.
pub fn controller_keys() -> Arc<FixedKeySource> {
    Arc::new(FixedKeySource::new([0x17; 32], 0x42))
}

pub fn config() -> CommsConfig {
    CommsConfig {
        controller_id: CONTROLLER,
        pod_address_hint: Some(POD),
        response_timeout_ms: 2_000,
        ..CommsConfig::default()
    }
}

pub fn command(payload: &[u8]) -> MessageBlock {
    MessageBlock::new(COMMAND, payload.to_vec())
}

/// Everything the software pod knows and does.
#[derive(Default)]
pub struct PodModel {
    pub address: u32,
    pub constants: PodConstants,
    /// Report a closed activation window on address assignment.
    pub activation_expired: bool,
    /// Report this address on address assignment instead of the assigned one.
    pub reported_address: Option<u32>,
    /// The pod's own session key sequence number.
    pub sequence_number: u64,
    /// Answer this many challenges with a resynchronization request
    /// regardless of the sequence number they carry.
    pub forced_resyncs: u32,
    /// Reply to the next encrypted command with this fault.
    pub fault_next: Option<FaultInfo>,
    /// Reply to the next encrypted command with a fault block carrying
    /// this raw payload.
    pub raw_fault_next: Option<Vec<u8>>,
    /// Answer hello with this fault instead of an ack.
    pub hello_fault: Option<FaultInfo>,
    /// Send a confirmation tag the controller cannot verify.
    pub corrupt_confirmation: bool,
    /// Send a challenge response the controller cannot verify.
    pub corrupt_response: bool,
    /// Send a resynchronization token the controller cannot verify.
    pub corrupt_resynchronization: bool,

    pub frames: usize,
    pub challenges: usize,
    /// Sequence numbers carried by accepted challenges.
    pub accepted_sequence_numbers: Vec<u64>,
    /// Nonce sequence of every encrypted command received.
    pub nonce_sequences: Vec<u32>,
    /// Decrypted command blocks in arrival order.
    pub commands: Vec<MessageBlock>,

    transcript: Option<PairingTranscript>,
    ltk: Option<[u8; 16]>,
    session: Option<(SessionCipher, u32)>,
}

impl PodModel {
    pub fn new(address: u32) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    fn handle(&mut self, raw: &[u8]) -> Vec<u8> {
        self.frames += 1;
        let (header, body) = split_frame(raw).unwrap();
        if header.encrypted {
            return self.handle_encrypted(raw, &header, body);
        }

        let blocks = decode_blocks(body).unwrap();
        let block = blocks.first().unwrap();
        let reply = match block.block_type {
            BlockType::Hello => match self.hello_fault {
                Some(fault) => fault.to_block(),
                None => Ack.to_block(),
            },
            BlockType::PairingKey => self.pairing_key(&PairingKey::from_block(block).unwrap()),
            BlockType::PairingConfirm => {
                self.pairing_confirm(&PairingConfirm::from_block(block).unwrap())
            }
            BlockType::AssignAddress => {
                let assign = AssignAddress::from_block(block).unwrap();
                let progress = if self.activation_expired {
                    dashpod_core::codec::POD_PROGRESS_ACTIVATION_TIME_EXCEEDED
                } else {
                    PROGRESS_ADDRESS_ASSIGNED
                };
                self.version_response(self.reported_address.unwrap_or(assign.address), progress)
            }
            BlockType::SetupPod => {
                let setup = SetupPod::from_block(block).unwrap();
                assert_eq!((setup.lot_number, setup.serial_number), (LOT, SERIAL));
                self.version_response(setup.address, PROGRESS_SETUP_COMPLETE)
            }
            BlockType::EapChallenge => self.challenge(&EapChallenge::from_block(block).unwrap()),
            other => panic!("software pod cannot handle plain {other:?}"),
        };

        let message = Message::new(self.address, header.source, header.sequence, vec![reply]);
        encode_message(&message.unwrap()).unwrap()
    }

    fn pairing_key(&mut self, request: &PairingKey) -> MessageBlock {
        let pair = KeyPair::from_secret_bytes(&POD_SECRET).unwrap();
        let transcript = PairingTranscript {
            controller_public: request.public_key,
            pod_public: pair.public_bytes(),
            controller_nonce: request.nonce,
            pod_nonce: POD_NONCE,
        };
        let shared = compute_shared_secret(&pair, &request.public_key).unwrap();
        self.ltk = Some(derive_long_term_key(&shared, &transcript).unwrap());
        self.transcript = Some(transcript);
        PairingKey {
            public_key: pair.public_bytes(),
            nonce: POD_NONCE,
        }
        .to_block()
    }

    fn pairing_confirm(&self, request: &PairingConfirm) -> MessageBlock {
        let ltk = self.ltk.as_ref().unwrap();
        let transcript = self.transcript.as_ref().unwrap();
        verify_confirmation(ltk, Role::Controller, transcript, &request.tag).unwrap();
        let mut tag = confirmation_tag(ltk, Role::Pod, transcript).unwrap();
        if self.corrupt_confirmation {
            tag[0] ^= 0x80;
        }
        PairingConfirm { tag }.to_block()
    }

    fn version_response(&self, address: u32, pod_progress: u8) -> MessageBlock {
        VersionResponse {
            firmware_version: FirmwareVersion {
                major: 4,
                minor: 10,
                patch: 0,
            },
            ble_firmware_version: FirmwareVersion {
                major: 1,
                minor: 2,
                patch: 3,
            },
            product_id: 4,
            pod_progress,
            lot_number: LOT,
            serial_number: SERIAL,
            address,
            constants: self.constants,
        }
        .to_block()
    }

    fn challenge(&mut self, challenge: &EapChallenge) -> MessageBlock {
        self.challenges += 1;
        let ltk = self.ltk.unwrap();
        let sequence_number =
            open_authentication_token(&ltk, &challenge.rand, &challenge.autn).unwrap();

        if self.forced_resyncs > 0 || sequence_number <= self.sequence_number {
            self.forced_resyncs = self.forced_resyncs.saturating_sub(1);
            let mut auts =
                resynchronization_token(&ltk, &challenge.rand, self.sequence_number).unwrap();
            if self.corrupt_resynchronization {
                let last = auts.len() - 1;
                auts[last] ^= 0x01;
            }
            return EapSynchronizationFailure { auts }.to_block();
        }

        self.sequence_number = sequence_number;
        self.accepted_sequence_numbers.push(sequence_number);
        let mut prefix = [0u8; 8];
        prefix[..4].copy_from_slice(&challenge.controller_iv);
        prefix[4..].copy_from_slice(&POD_IV);
        let key = session_cipher_key(&ltk, &challenge.rand).unwrap();
        self.session = Some((SessionCipher::new(&key, prefix), 0));
        let mut res = challenge_response(&ltk, &challenge.rand).unwrap();
        if self.corrupt_response {
            res[0] ^= 0x01;
        }
        EapSuccess { res, pod_iv: POD_IV }.to_block()
    }

    fn handle_encrypted(&mut self, raw: &[u8], header: &FrameHeader, body: &[u8]) -> Vec<u8> {
        let (cipher, sequence) = self.session.as_ref().unwrap();
        let sequence = *sequence;
        let plaintext = cipher
            .open(sequence, Direction::ToPod, &raw[..HEADER_SIZE], body)
            .unwrap();
        self.nonce_sequences.push(sequence);
        self.commands.extend(decode_blocks(&plaintext).unwrap());

        let reply = match (self.fault_next.take(), self.raw_fault_next.take()) {
            (Some(fault), _) => fault.to_block(),
            (None, Some(payload)) => MessageBlock::new(u8::from(BlockType::Fault), payload),
            (None, None) => Ack.to_block(),
        };
        let reply_body = encode_blocks(&[reply]).unwrap();
        let reply_header = FrameHeader::new(
            true,
            header.sequence,
            reply_body.len() + TAG_SIZE,
            self.address,
            header.source,
        )
        .unwrap();
        let (cipher, nonce_sequence) = self.session.as_mut().unwrap();
        let sealed = cipher
            .seal(
                sequence,
                Direction::ToController,
                &reply_header.encode(),
                &reply_body,
            )
            .unwrap();
        *nonce_sequence += 1;
        encode_frame(&reply_header, &sealed).unwrap()
    }
}

/// Link to a [`PodModel`]; clones of the handle see the same pod.
pub struct SimulatedPod {
    model: Arc<Mutex<PodModel>>,
}

impl SimulatedPod {
    pub fn new(model: PodModel) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// A second link to the same pod, e.g. after a controller restart.
    pub fn reconnect(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
        }
    }

    pub fn model(&self) -> MutexGuard<'_, PodModel> {
        self.model.lock().unwrap()
    }
}

impl PodLink for SimulatedPod {
    async fn send_and_await_response(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
        Ok(self.model.lock().unwrap().handle(frame))
    }
}

/// Memory store whose saves can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
    failing_progress: Mutex<Option<SetupProgress>>,
}

impl FlakyStore {
    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every save of a record that has reached `progress`.
    pub fn fail_saves_at(&self, progress: SetupProgress) {
        *self.failing_progress.lock().unwrap() = Some(progress);
    }

    pub fn snapshot(&self) -> Option<PodState> {
        self.inner.snapshot()
    }
}

impl PodStateStore for FlakyStore {
    fn load(&self) -> Result<Option<PodState>, StoreError> {
        self.inner.load()
    }

    fn save(&self, state: &PodState) -> Result<(), StoreError> {
        let at = *self.failing_progress.lock().unwrap();
        if self.failing.load(Ordering::SeqCst) || at == Some(state.setup_progress) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.save(state)
    }
}
