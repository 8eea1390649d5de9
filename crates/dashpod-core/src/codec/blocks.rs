//! Typed block payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BlockType, MessageBlock, Reader};
use crate::constants::PodConstants;
use crate::error::{Error, Result};

/// Pod progress value reported once the activation window has closed.
pub const POD_PROGRESS_ACTIVATION_TIME_EXCEEDED: u8 = 0x0F;

/// Fault code recorded when a fault block carries no readable code.
pub const UNKNOWN_FAULT_CODE: u8 = 0xFF;

/// A payload with a fixed block type and fixed-size layout.
pub trait BlockPayload: Sized {
    const BLOCK_TYPE: BlockType;
    const SIZE: usize;

    fn write_payload(&self, out: &mut Vec<u8>);

    fn read_payload(payload: &[u8]) -> Result<Self>;

    fn to_block(&self) -> MessageBlock {
        let mut payload = Vec::with_capacity(Self::SIZE);
        self.write_payload(&mut payload);
        MessageBlock {
            block_type: Self::BLOCK_TYPE,
            payload,
        }
    }

    fn from_block(block: &MessageBlock) -> Result<Self> {
        if block.block_type != Self::BLOCK_TYPE {
            return Err(Error::UnexpectedBlock {
                expected: Self::BLOCK_TYPE,
                found: block.block_type,
            });
        }
        if block.payload.len() != Self::SIZE {
            return Err(Error::BlockLength {
                block_type: Self::BLOCK_TYPE,
                expected: Self::SIZE,
                actual: block.payload.len(),
            });
        }
        Self::read_payload(&block.payload)
    }
}

/// Discovery hello carrying the controller's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub controller_address: u32,
}

impl BlockPayload for Hello {
    const BLOCK_TYPE: BlockType = BlockType::Hello;
    const SIZE: usize = 4;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.controller_address.to_be_bytes());
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            controller_address: r.u32()?,
        })
    }
}

/// Empty acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

impl BlockPayload for Ack {
    const BLOCK_TYPE: BlockType = BlockType::Ack;
    const SIZE: usize = 0;

    fn write_payload(&self, _out: &mut Vec<u8>) {}

    fn read_payload(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// One side's X25519 public key and pairing nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingKey {
    pub public_key: [u8; 32],
    pub nonce: [u8; 16],
}

impl BlockPayload for PairingKey {
    const BLOCK_TYPE: BlockType = BlockType::PairingKey;
    const SIZE: usize = 48;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.nonce);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            public_key: r.array()?,
            nonce: r.array()?,
        })
    }
}

/// Key confirmation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingConfirm {
    pub tag: [u8; 16],
}

impl BlockPayload for PairingConfirm {
    const BLOCK_TYPE: BlockType = BlockType::PairingConfirm;
    const SIZE: usize = 16;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { tag: r.array()? })
    }
}

/// Assign the pod its permanent address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignAddress {
    pub address: u32,
}

impl BlockPayload for AssignAddress {
    const BLOCK_TYPE: BlockType = BlockType::AssignAddress;
    const SIZE: usize = 4;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_be_bytes());
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { address: r.u32()? })
    }
}

/// Provisioning command: activation time plus the pod's manufacturing ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPod {
    pub address: u32,
    pub lot_number: u32,
    pub serial_number: u32,
    /// Seconds since the Unix epoch, UTC.
    pub activation_time: u32,
}

impl BlockPayload for SetupPod {
    const BLOCK_TYPE: BlockType = BlockType::SetupPod;
    const SIZE: usize = 16;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.address.to_be_bytes());
        out.extend_from_slice(&self.lot_number.to_be_bytes());
        out.extend_from_slice(&self.serial_number.to_be_bytes());
        out.extend_from_slice(&self.activation_time.to_be_bytes());
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            address: r.u32()?,
            lot_number: r.u32()?,
            serial_number: r.u32()?,
            activation_time: r.u32()?,
        })
    }
}

/// Three-part firmware version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FirmwareVersion {
    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let [major, minor, patch] = r.array()?;
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.major, self.minor, self.patch]);
    }
}

/// The pod's answer to address assignment and setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionResponse {
    pub firmware_version: FirmwareVersion,
    pub ble_firmware_version: FirmwareVersion,
    pub product_id: u8,
    pub pod_progress: u8,
    pub lot_number: u32,
    pub serial_number: u32,
    pub address: u32,
    pub constants: PodConstants,
}

impl VersionResponse {
    pub const fn activation_time_exceeded(&self) -> bool {
        self.pod_progress == POD_PROGRESS_ACTIVATION_TIME_EXCEEDED
    }
}

impl BlockPayload for VersionResponse {
    const BLOCK_TYPE: BlockType = BlockType::VersionResponse;
    const SIZE: usize = 20 + PodConstants::WIRE_SIZE;

    fn write_payload(&self, out: &mut Vec<u8>) {
        self.firmware_version.write(out);
        self.ble_firmware_version.write(out);
        out.push(self.product_id);
        out.push(self.pod_progress);
        out.extend_from_slice(&self.lot_number.to_be_bytes());
        out.extend_from_slice(&self.serial_number.to_be_bytes());
        out.extend_from_slice(&self.address.to_be_bytes());
        self.constants.write(out);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            firmware_version: FirmwareVersion::read(&mut r)?,
            ble_firmware_version: FirmwareVersion::read(&mut r)?,
            product_id: r.u8()?,
            pod_progress: r.u8()?,
            lot_number: r.u32()?,
            serial_number: r.u32()?,
            address: r.u32()?,
            constants: PodConstants::read(&mut r)?,
        })
    }
}

/// Fault reported by the pod. Once seen, the pod is non-operational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInfo {
    pub code: u8,
    pub pod_progress: u8,
    pub minutes_since_activation: u16,
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault {:#04x} (progress {}, {} min since activation)",
            self.code, self.pod_progress, self.minutes_since_activation
        )
    }
}

impl FaultInfo {
    /// Best-effort reading of a fault block with the wrong length.
    pub fn from_unreadable(payload: &[u8]) -> Self {
        Self {
            code: payload.first().copied().unwrap_or(UNKNOWN_FAULT_CODE),
            pod_progress: payload.get(1).copied().unwrap_or(0),
            minutes_since_activation: 0,
        }
    }
}

impl BlockPayload for FaultInfo {
    const BLOCK_TYPE: BlockType = BlockType::Fault;
    const SIZE: usize = 4;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.push(self.code);
        out.push(self.pod_progress);
        out.extend_from_slice(&self.minutes_since_activation.to_be_bytes());
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            code: r.u8()?,
            pod_progress: r.u8()?,
            minutes_since_activation: r.u16()?,
        })
    }
}

/// Session key challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EapChallenge {
    pub rand: [u8; 16],
    pub autn: [u8; 14],
    pub controller_iv: [u8; 4],
}

impl BlockPayload for EapChallenge {
    const BLOCK_TYPE: BlockType = BlockType::EapChallenge;
    const SIZE: usize = 34;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.rand);
        out.extend_from_slice(&self.autn);
        out.extend_from_slice(&self.controller_iv);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            rand: r.array()?,
            autn: r.array()?,
            controller_iv: r.array()?,
        })
    }
}

/// Pod accepted the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EapSuccess {
    pub res: [u8; 8],
    pub pod_iv: [u8; 4],
}

impl BlockPayload for EapSuccess {
    const BLOCK_TYPE: BlockType = BlockType::EapSuccess;
    const SIZE: usize = 12;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.res);
        out.extend_from_slice(&self.pod_iv);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            res: r.array()?,
            pod_iv: r.array()?,
        })
    }
}

/// Pod rejected the challenge because its own counter is ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EapSynchronizationFailure {
    pub auts: [u8; 14],
}

impl BlockPayload for EapSynchronizationFailure {
    const BLOCK_TYPE: BlockType = BlockType::EapSynchronizationFailure;
    const SIZE: usize = 14;

    fn write_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.auts);
    }

    fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { auts: r.array()? })
    }
}
