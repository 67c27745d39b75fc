use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Result, WireError};

pub const HANDSHAKE: &[u8] = b"DWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// Upper bound on a single frame, including the header.
///
/// The agent never sends anything close to this in practice; the limit exists so
/// a corrupt length prefix cannot make us allocate gigabytes.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Command set used by the agent for composite event packets.
pub const CMD_SET_EVENT: u8 = 64;
pub const CMD_COMPOSITE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    },
    Reply {
        id: u32,
        error_code: u16,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command,
    Reply,
    Event,
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Command { id, .. } | Packet::Reply { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Reply { .. } => PacketKind::Reply,
            Packet::Command {
                command_set: CMD_SET_EVENT,
                command: CMD_COMPOSITE,
                ..
            } => PacketKind::Event,
            Packet::Command { .. } => PacketKind::Command,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Packet::Command { payload, .. } | Packet::Reply { payload, .. } => payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload().len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut impl BufMut) {
        let length = self.encoded_len() as u32;
        match self {
            Packet::Command {
                id,
                command_set,
                command,
                payload,
            } => {
                out.put_u32(length);
                out.put_u32(*id);
                out.put_u8(0); // flags
                out.put_u8(*command_set);
                out.put_u8(*command);
                out.put_slice(payload);
            }
            Packet::Reply {
                id,
                error_code,
                payload,
            } => {
                out.put_u32(length);
                out.put_u32(*id);
                out.put_u8(FLAG_REPLY);
                out.put_u16(*error_code);
                out.put_slice(payload);
            }
        }
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    Packet::Command {
        id,
        command_set,
        command,
        payload: payload.to_vec(),
    }
    .encode()
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    Packet::Reply {
        id,
        error_code,
        payload: payload.to_vec(),
    }
    .encode()
}

/// Length-prefixed frame codec.
///
/// The decoder is restartable: it keeps partial frames in the read buffer and
/// yields `None` until a full frame has arrived.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_bytes: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_BYTES)
    }
}

impl PacketCodec {
    pub fn new(max_packet_bytes: usize) -> Self {
        Self {
            max_packet_bytes: max_packet_bytes.max(HEADER_LEN),
        }
    }

    pub fn max_packet_bytes(&self) -> usize {
        self.max_packet_bytes
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < HEADER_LEN {
            return Err(WireError::MalformedPacket(format!(
                "declared length {length} is smaller than the {HEADER_LEN}-byte header"
            )));
        }
        // Reject before reserving so a corrupt prefix never drives an allocation.
        if length > self.max_packet_bytes {
            return Err(WireError::MalformedPacket(format!(
                "declared length {length} exceeds maximum of {} bytes",
                self.max_packet_bytes
            )));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        frame.advance(4);
        let id = frame.get_u32();
        let flags = frame.get_u8();
        let packet = if flags & FLAG_REPLY != 0 {
            let error_code = frame.get_u16();
            Packet::Reply {
                id,
                error_code,
                payload: frame.to_vec(),
            }
        } else {
            let command_set = frame.get_u8();
            let command = frame.get_u8();
            Packet::Command {
                id,
                command_set,
                command,
                payload: frame.to_vec(),
            }
        };
        Ok(Some(packet))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None if src.is_empty() => Ok(None),
            None => Err(WireError::MalformedPacket(format!(
                "connection closed inside a frame ({} trailing bytes)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = WireError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let len = item.encoded_len();
        if len > self.max_packet_bytes || u32::try_from(len).is_err() {
            return Err(WireError::MalformedPacket(format!(
                "outgoing packet of {len} bytes exceeds maximum of {} bytes",
                self.max_packet_bytes
            )));
        }
        dst.reserve(len);
        item.write_to(dst);
        Ok(())
    }
}

/// Decode every complete packet in `input`.
///
/// Trailing bytes that do not form a complete frame are reported as
/// [`WireError::MalformedPacket`], mirroring what the stream decoder does at EOF.
pub fn decode_packet_bytes(input: &[u8]) -> Result<Vec<Packet>> {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::from(input);
    let mut packets = Vec::new();
    while let Some(packet) = codec.decode_eof(&mut buf)? {
        packets.push(packet);
    }
    Ok(packets)
}

#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // Strings are length-prefixed with a u32 number of UTF-8 bytes.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Object, type, method and thread ids are all 4 bytes on the wire.
    pub fn write_id(&mut self, id: i32) {
        self.write_i32(id);
    }
}

pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                WireError::MalformedPacket(format!(
                    "buffer underflow: need {n} bytes at {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut be = [0u8; 8];
        be.copy_from_slice(b);
        Ok(i64::from_be_bytes(be))
    }

    pub fn read_id(&mut self) -> Result<i32> {
        self.read_i32()
    }

    /// Read a u32 element count, rejecting counts that cannot fit in the rest of
    /// the payload given `min_element_len` bytes per element.
    pub fn read_count(&mut self, min_element_len: usize) -> Result<usize> {
        let count = self.read_u32()? as usize;
        if count.saturating_mul(min_element_len.max(1)) > self.remaining() {
            return Err(WireError::MalformedPacket(format!(
                "element count {count} exceeds remaining payload ({} bytes)",
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WireError::MalformedPacket(format!("invalid utf-8 string: {e}")))
    }
}
