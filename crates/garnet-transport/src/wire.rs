//! Wire framing shared by both channel directions.
//!
//! Every packet starts with a fixed 7-byte header in network byte order:
//! `channel:u8 | seq:u16 | ts:u32`, followed by an opaque payload. ACK
//! packets carry a fixed 18-byte selective-acknowledgment payload instead of
//! application data: `cum_ack:u16` followed by four `(start, end)` block
//! slots, zero-padded when fewer blocks are present.

use crate::seq::seq_in_range;
use bytes::Bytes;
use garnet_binary::{BinaryError, BinaryReader, BinaryWriter, Readable, Writable};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 7;

/// Maximum number of selective-acknowledgment blocks carried per ACK.
pub const MAX_SACK_BLOCKS: usize = 4;

/// Size of the fixed ACK payload in bytes.
pub const SACK_PAYLOAD_SIZE: usize = 2 + MAX_SACK_BLOCKS * 4;

/// Largest datagram the pump will read off the socket.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Logical channel a packet belongs to, carried as the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Reliable data, acknowledged and retransmitted.
    Data = 0,
    /// Best-effort data, fire and forget.
    Unreliable = 1,
    /// Selective acknowledgment for the reliable channel.
    Ack = 2,
}

impl Channel {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Channel::Data),
            1 => Some(Channel::Unreliable),
            2 => Some(Channel::Ack),
            _ => None,
        }
    }
}

/// The fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel: Channel,
    pub seq: u16,
    pub ts_ms: u32,
}

impl Header {
    pub fn new(channel: Channel, seq: u16, ts_ms: u32) -> Self {
        Self { channel, seq, ts_ms }
    }

    /// Builds a complete wire packet: this header followed by `payload`.
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut writer = BinaryWriter::with_capacity(HEADER_SIZE + payload.len());
        writer.write_u8(self.channel.tag());
        writer.write_u16(self.seq);
        writer.write_u32(self.ts_ms);
        writer.write_bytes(payload);
        writer.freeze()
    }
}

impl Readable for Header {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        let tag = reader.read_u8()?;
        let channel = Channel::from_tag(tag)
            .ok_or_else(|| BinaryError::InvalidData(format!("unknown channel tag {tag:#04x}")))?;
        let seq = reader.read_u16()?;
        let ts_ms = reader.read_u32()?;
        Ok(Self { channel, seq, ts_ms })
    }
}

impl Writable for Header {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u8(self.channel.tag());
        writer.write_u16(self.seq);
        writer.write_u32(self.ts_ms);
        Ok(())
    }
}

/// An inclusive run of received sequence numbers beyond the cumulative point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u16,
    pub end: u16,
}

impl SackBlock {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

/// The selective-acknowledgment payload of an ACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackPayload {
    /// Lowest sequence number the receiver has not yet delivered.
    pub cum_ack: u16,
    /// Up to [`MAX_SACK_BLOCKS`] received runs beyond `cum_ack`.
    pub blocks: Vec<SackBlock>,
}

impl SackPayload {
    pub fn new(cum_ack: u16, blocks: Vec<SackBlock>) -> Self {
        Self { cum_ack, blocks }
    }

    /// Encodes into the fixed 18-byte layout. Unused slots are zero-padded;
    /// blocks beyond the fourth are dropped (the peer learns them from later
    /// acknowledgments).
    pub fn encode(&self) -> Bytes {
        let mut writer = BinaryWriter::with_capacity(SACK_PAYLOAD_SIZE);
        writer.write_u16(self.cum_ack);
        for block in self.blocks.iter().take(MAX_SACK_BLOCKS) {
            writer.write_u16(block.start);
            writer.write_u16(block.end);
        }
        for _ in self.blocks.len().min(MAX_SACK_BLOCKS)..MAX_SACK_BLOCKS {
            writer.write_u16(0);
            writer.write_u16(0);
        }
        writer.freeze()
    }

    /// Tolerant decode: short payloads are zero-extended to the fixed size
    /// before parsing. A `(0, 0)` slot at index 1 or later terminates the
    /// block list; at index 0 it is a genuine single-sequence block for
    /// sequence 0. Blocks whose start lies after their end are discarded.
    pub fn parse(payload: &[u8]) -> Self {
        let mut buf = [0u8; SACK_PAYLOAD_SIZE];
        let len = payload.len().min(SACK_PAYLOAD_SIZE);
        buf[..len].copy_from_slice(&payload[..len]);

        let cum_ack = u16::from_be_bytes([buf[0], buf[1]]);
        let mut blocks = Vec::new();
        for i in 0..MAX_SACK_BLOCKS {
            let off = 2 + i * 4;
            let start = u16::from_be_bytes([buf[off], buf[off + 1]]);
            let end = u16::from_be_bytes([buf[off + 2], buf[off + 3]]);

            if start == 0 && end == 0 && i > 0 {
                break;
            }
            if seq_in_range(start, start, end) {
                blocks.push(SackBlock { start, end });
            }
        }

        Self { cum_ack, blocks }
    }
}

impl Writable for SackPayload {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_bytes(&self.encode());
        Ok(())
    }
}
