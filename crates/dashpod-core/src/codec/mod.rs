//! Message framing for the pod link.
//!
//! A frame is a fixed 14-byte header followed by a body:
//!
//! ```text
//! 0..2   magic "TW"
//! 2      flags: bits 7-5 version (0), bit 4 encrypted, bits 3-0 sequence
//! 3      reserved (written 0, ignored)
//! 4..6   body length, u16 big-endian
//! 6..10  source address, u32 big-endian
//! 10..14 destination address, u32 big-endian
//! ```
//!
//! A plaintext body is a run of blocks `{type: u8, length: u16, payload}`.
//! An encrypted body is the AEAD ciphertext of that run with the tag
//! appended; the header is the associated data. Encryption itself lives in
//! the transport, this module only frames bytes.

mod blocks;

pub use blocks::{
    Ack, AssignAddress, BlockPayload, EapChallenge, EapSuccess, EapSynchronizationFailure,
    FaultInfo, FirmwareVersion, Hello, POD_PROGRESS_ACTIVATION_TIME_EXCEEDED, PairingConfirm,
    PairingKey, SetupPod, UNKNOWN_FAULT_CODE, VersionResponse,
};

use crate::error::{Error, Result};

/// Frame magic.
pub const MAGIC: [u8; 2] = *b"TW";

/// Size of the frame header.
pub const HEADER_SIZE: usize = 14;

/// Size of a block's type + length prefix.
pub const BLOCK_HEADER_SIZE: usize = 3;

/// Largest 4-bit message sequence number.
pub const MAX_SEQUENCE: u8 = 0x0F;

const VERSION: u8 = 0;
const ENCRYPTED_FLAG: u8 = 0x10;

/// Block type codes.
///
/// Unknown codes decode to [`BlockType::Other`]. Its [`OpaqueCode`] can
/// only come from `From<u8>`, so a known code never ends up wrapped in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    VersionResponse,
    Fault,
    SetupPod,
    AssignAddress,
    Hello,
    PairingKey,
    PairingConfirm,
    Ack,
    EapChallenge,
    EapSuccess,
    EapSynchronizationFailure,
    /// Opaque command/response passed through unexamined.
    Other(OpaqueCode),
}

/// A block type code with no dedicated variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueCode(u8);

impl OpaqueCode {
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<u8> for BlockType {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::VersionResponse,
            0x02 => Self::Fault,
            0x03 => Self::SetupPod,
            0x07 => Self::AssignAddress,
            0x10 => Self::Hello,
            0x11 => Self::PairingKey,
            0x12 => Self::PairingConfirm,
            0x1F => Self::Ack,
            0x20 => Self::EapChallenge,
            0x21 => Self::EapSuccess,
            0x22 => Self::EapSynchronizationFailure,
            other => Self::Other(OpaqueCode(other)),
        }
    }
}

impl From<BlockType> for u8 {
    fn from(block_type: BlockType) -> Self {
        match block_type {
            BlockType::VersionResponse => 0x01,
            BlockType::Fault => 0x02,
            BlockType::SetupPod => 0x03,
            BlockType::AssignAddress => 0x07,
            BlockType::Hello => 0x10,
            BlockType::PairingKey => 0x11,
            BlockType::PairingConfirm => 0x12,
            BlockType::Ack => 0x1F,
            BlockType::EapChallenge => 0x20,
            BlockType::EapSuccess => 0x21,
            BlockType::EapSynchronizationFailure => 0x22,
            BlockType::Other(code) => code.0,
        }
    }
}

/// One typed payload inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub block_type: BlockType,
    pub payload: Vec<u8>,
}

impl MessageBlock {
    /// Build a block from a raw type code.
    pub fn new(code: u8, payload: Vec<u8>) -> Self {
        Self {
            block_type: BlockType::from(code),
            payload,
        }
    }
}

/// An addressed, sequenced group of blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: u32,
    pub destination: u32,
    pub sequence: u8,
    pub blocks: Vec<MessageBlock>,
}

impl Message {
    pub fn new(
        source: u32,
        destination: u32,
        sequence: u8,
        blocks: Vec<MessageBlock>,
    ) -> Result<Self> {
        if sequence > MAX_SEQUENCE {
            return Err(Error::InvalidSequence(sequence));
        }
        Ok(Self {
            source,
            destination,
            sequence,
            blocks,
        })
    }

    /// Type of the first block, if any.
    pub fn leading_block_type(&self) -> Option<BlockType> {
        self.blocks.first().map(|b| b.block_type)
    }

    /// First block of the given type.
    pub fn find(&self, block_type: BlockType) -> Option<&MessageBlock> {
        self.blocks.iter().find(|b| b.block_type == block_type)
    }

    /// The fault report carried by this message, if the pod sent one.
    ///
    /// A fault block that does not decode still counts as a fault; see
    /// [`FaultInfo::from_unreadable`].
    pub fn fault(&self) -> Option<FaultInfo> {
        self.find(BlockType::Fault).map(|block| {
            FaultInfo::from_block(block)
                .unwrap_or_else(|_| FaultInfo::from_unreadable(&block.payload))
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub encrypted: bool,
    pub sequence: u8,
    pub body_len: u16,
    pub source: u32,
    pub destination: u32,
}

impl FrameHeader {
    pub fn new(
        encrypted: bool,
        sequence: u8,
        body_len: usize,
        source: u32,
        destination: u32,
    ) -> Result<Self> {
        if sequence > MAX_SEQUENCE {
            return Err(Error::InvalidSequence(sequence));
        }
        let body_len = u16::try_from(body_len).map_err(|_| Error::PayloadTooLarge(body_len))?;
        Ok(Self {
            encrypted,
            sequence,
            body_len,
            source,
            destination,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..2].copy_from_slice(&MAGIC);
        let mut flags = (VERSION << 5) | (self.sequence & MAX_SEQUENCE);
        if self.encrypted {
            flags |= ENCRYPTED_FLAG;
        }
        out[2] = flags;
        out[4..6].copy_from_slice(&self.body_len.to_be_bytes());
        out[6..10].copy_from_slice(&self.source.to_be_bytes());
        out[10..14].copy_from_slice(&self.destination.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.array::<2>()?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }
        let flags = r.u8()?;
        let version = flags >> 5;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let _reserved = r.u8()?;
        Ok(Self {
            encrypted: flags & ENCRYPTED_FLAG != 0,
            sequence: flags & MAX_SEQUENCE,
            body_len: r.u16()?,
            source: r.u32()?,
            destination: r.u32()?,
        })
    }
}

/// Serialize blocks into a plaintext body.
pub fn encode_blocks(blocks: &[MessageBlock]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(
        blocks
            .iter()
            .map(|b| BLOCK_HEADER_SIZE + b.payload.len())
            .sum(),
    );
    for block in blocks {
        let len = u16::try_from(block.payload.len())
            .map_err(|_| Error::PayloadTooLarge(block.payload.len()))?;
        out.push(u8::from(block.block_type));
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&block.payload);
    }
    Ok(out)
}

/// Parse a plaintext body into blocks.
pub fn decode_blocks(body: &[u8]) -> Result<Vec<MessageBlock>> {
    let mut r = Reader::new(body);
    let mut blocks = Vec::new();
    while !r.is_empty() {
        let code = r.u8()?;
        let len = usize::from(r.u16()?);
        let payload = r.take(len)?.to_vec();
        blocks.push(MessageBlock::new(code, payload));
    }
    Ok(blocks)
}

/// Prepend a header to an already-built body.
pub fn encode_frame(header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>> {
    if usize::from(header.body_len) != body.len() {
        return Err(Error::LengthMismatch {
            declared: usize::from(header.body_len),
            actual: body.len(),
        });
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a raw frame into its header and body, checking the declared length.
pub fn split_frame(raw: &[u8]) -> Result<(FrameHeader, &[u8])> {
    let header = FrameHeader::decode(raw)?;
    let body = &raw[HEADER_SIZE..];
    if body.len() != usize::from(header.body_len) {
        return Err(Error::LengthMismatch {
            declared: usize::from(header.body_len),
            actual: body.len(),
        });
    }
    Ok((header, body))
}

/// Encode a message as a plaintext frame.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let body = encode_blocks(&message.blocks)?;
    let header = FrameHeader::new(
        false,
        message.sequence,
        body.len(),
        message.source,
        message.destination,
    )?;
    encode_frame(&header, &body)
}

/// Decode a plaintext frame.
pub fn decode_message(raw: &[u8]) -> Result<Message> {
    let (header, body) = split_frame(raw)?;
    if header.encrypted {
        return Err(Error::EncryptedFrame);
    }
    Ok(Message {
        source: header.source,
        destination: header.destination,
        sequence: header.sequence,
        blocks: decode_blocks(body)?,
    })
}

/// Cursor over a byte slice with big-endian readers.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(Error::Truncated {
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_blocks() -> Vec<MessageBlock> {
        vec![
            AssignAddress {
                address: 0x1F08_A3C2,
            }
            .to_block(),
            MessageBlock::new(0x0E, vec![0x00]),
            MessageBlock::new(0x1D, Vec::new()),
        ]
    }

    #[test]
    fn blocks_roundtrip() {
        let blocks = sample_blocks();
        let body = encode_blocks(&blocks).unwrap();
        assert_eq!(decode_blocks(&body).unwrap(), blocks);
        assert!(decode_blocks(&[]).unwrap().is_empty());
    }

    #[test]
    fn message_roundtrip() {
        let message = Message::new(0x1092, 0x1F08_A3C2, 15, sample_blocks()).unwrap();
        let raw = encode_message(&message).unwrap();
        assert_eq!(&raw[..2], b"TW");
        assert_eq!(decode_message(&raw).unwrap(), message);
    }

    #[test]
    fn header_layout() {
        let header = FrameHeader::new(true, 9, 0x0102, 0xAABB_CCDD, 0x1122_3344).unwrap();
        let bytes = header.encode();
        assert_eq!(
            bytes,
            [
                b'T', b'W', 0x19, 0x00, 0x01, 0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33,
                0x44
            ]
        );
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn unknown_codes_stay_opaque_and_known_codes_are_canonical() {
        assert!(matches!(BlockType::from(0x0E), BlockType::Other(c) if c.get() == 0x0E));
        assert_eq!(BlockType::from(0x07), BlockType::AssignAddress);
        assert_eq!(MessageBlock::new(0x02, vec![]).block_type, BlockType::Fault);
        for code in 0..=u8::MAX {
            assert_eq!(u8::from(BlockType::from(code)), code);
            let block = MessageBlock::new(code, vec![code]);
            let body = encode_blocks(std::slice::from_ref(&block)).unwrap();
            assert_eq!(decode_blocks(&body).unwrap(), vec![block]);
        }
    }

    #[test]
    fn sequence_number_is_four_bits() {
        assert!(matches!(
            Message::new(1, 2, 16, vec![]),
            Err(Error::InvalidSequence(16))
        ));
        assert!(matches!(
            FrameHeader::new(false, 0x10, 0, 1, 2),
            Err(Error::InvalidSequence(0x10))
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = encode_message(&Message::new(1, 2, 0, vec![]).unwrap()).unwrap();
        raw[0] = b'X';
        assert!(matches!(decode_message(&raw), Err(Error::BadMagic(_))));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut raw = encode_message(&Message::new(1, 2, 0, vec![]).unwrap()).unwrap();
        raw[2] |= 0x20;
        assert!(matches!(
            decode_message(&raw),
            Err(Error::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut raw = encode_message(&Message::new(1, 2, 0, sample_blocks()).unwrap()).unwrap();
        raw.push(0);
        assert!(matches!(
            decode_message(&raw),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn rejects_truncated_header_and_block() {
        assert!(matches!(
            FrameHeader::decode(b"TW\x00"),
            Err(Error::Truncated { .. })
        ));
        // Block claims 4 payload bytes, carries 1.
        assert!(matches!(
            decode_blocks(&[0x0E, 0x00, 0x04, 0xFF]),
            Err(Error::Truncated {
                needed: 4,
                available: 1
            })
        ));
    }

    #[test]
    fn plaintext_decode_refuses_encrypted_frames() {
        let header = FrameHeader::new(true, 0, 0, 1, 2).unwrap();
        let raw = encode_frame(&header, &[]).unwrap();
        assert!(matches!(decode_message(&raw), Err(Error::EncryptedFrame)));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let block = MessageBlock::new(0x0E, vec![0u8; 70_000]);
        assert!(matches!(
            encode_blocks(&[block]),
            Err(Error::PayloadTooLarge(70_000))
        ));
    }

    #[test]
    fn fault_lookup() {
        let fault = FaultInfo {
            code: 0x31,
            pod_progress: 8,
            minutes_since_activation: 120,
        };
        let message = Message::new(2, 1, 3, vec![fault.to_block()]).unwrap();
        assert_eq!(message.fault(), Some(fault));
        assert_eq!(message.leading_block_type(), Some(BlockType::Fault));
        assert!(Message::new(2, 1, 3, vec![]).unwrap().fault().is_none());
    }

    #[test]
    fn short_fault_block_is_still_a_fault() {
        let short = Message::new(2, 1, 3, vec![MessageBlock::new(0x02, vec![0x31, 0x08])]).unwrap();
        let fault = short.fault().unwrap();
        assert_eq!(fault.code, 0x31);
        assert_eq!(fault.minutes_since_activation, 0);

        let empty = Message::new(2, 1, 3, vec![MessageBlock::new(0x02, vec![])]).unwrap();
        assert_eq!(empty.fault().unwrap().code, UNKNOWN_FAULT_CODE);
    }
}
