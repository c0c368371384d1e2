//! Wire-format definitions for protocol packets.
//!
//! Every datagram exchanged between client, dispatcher and worker is a
//! [`Packet`].  This module is responsible for:
//! - Defining the on-wire binary layout (kind, sequence number, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for truncated input, unknown kinds, or oversized payloads.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |        Sequence Number        |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 3 bytes.  The payload runs to the end
//! of the datagram and never exceeds [`MAX_PAYLOAD`] bytes.  There is no
//! checksum: only loss, reordering and duplication are handled.

use std::fmt;

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 3;

/// Largest payload a single packet may carry (one file chunk).
pub const MAX_PAYLOAD: usize = 4096;

/// Largest encoded packet: header plus a full payload.
pub const MAX_PACKET: usize = HEADER_LEN + MAX_PAYLOAD;

const OFF_KIND: usize = 0;
const OFF_SEQ: usize = 1;

/// Packet kind tag (first byte on the wire).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Handshake request: the client wants to fetch a file.
    Download = 0,
    /// Handshake request: the client wants to store a file.
    Upload = 1,
    /// Acknowledgement of the packet carrying the same sequence number.
    Ack = 2,
    /// One chunk of file contents.
    Data = 3,
    /// End of the data stream.
    Close = 4,
    /// Request rejected; payload carries a UTF-8 message.
    Error = 5,
}

impl Kind {
    /// Decode a wire tag, or `None` when the value is out of range.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Kind::Download,
            1 => Kind::Upload,
            2 => Kind::Ack,
            3 => Kind::Data,
            4 => Kind::Close,
            5 => Kind::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Download => "DOWNLOAD",
            Kind::Upload => "UPLOAD",
            Kind::Ack => "ACK",
            Kind::Data => "DATA",
            Kind::Close => "CLOSE",
            Kind::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: kind, sequence number and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: Kind,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Handshake request for `file_name` (always sequence 0).
    pub fn request(kind: Kind, file_name: &str) -> Self {
        Self {
            kind,
            seq: 0,
            payload: file_name.as_bytes().to_vec(),
        }
    }

    pub fn ack(seq: u16) -> Self {
        Self {
            kind: Kind::Ack,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn data(seq: u16, payload: Vec<u8>) -> Self {
        Self {
            kind: Kind::Data,
            seq,
            payload,
        }
    }

    pub fn close(seq: u16) -> Self {
        Self {
            kind: Kind::Close,
            seq,
            payload: Vec::new(),
        }
    }

    /// Error packet.  Messages longer than [`MAX_PAYLOAD`] are cut at the last
    /// character boundary that fits.
    pub fn error(seq: u16, message: &str) -> Self {
        let mut end = message.len().min(MAX_PAYLOAD);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            kind: Kind::Error,
            seq,
            payload: message[..end].as_bytes().to_vec(),
        }
    }

    /// Payload interpreted as text (file name or error message).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// Fails with [`PacketError::PayloadTooLarge`] when the payload exceeds
    /// [`MAX_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the kind byte is not a known [`Kind`], or
    /// - the payload exceeds [`MAX_PAYLOAD`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let (kind, seq) = header(buf)?;
        let body = payload(buf);
        if body.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(body.len()));
        }
        Ok(Packet {
            kind,
            seq,
            payload: body.to_vec(),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.seq)?;
        if !self.payload.is_empty() {
            write!(f, " ({} bytes)", self.payload.len())?;
        }
        Ok(())
    }
}

/// Decode only the fixed header of a raw datagram.
pub fn header(buf: &[u8]) -> Result<(Kind, u16), PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::TooShort(buf.len()));
    }
    let kind = Kind::from_u8(buf[OFF_KIND]).ok_or(PacketError::UnknownKind(buf[OFF_KIND]))?;
    let seq = u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]);
    Ok((kind, seq))
}

/// Everything after the fixed header.  Empty for buffers shorter than it.
pub fn payload(buf: &[u8]) -> &[u8] {
    buf.get(HEADER_LEN..).unwrap_or(&[])
}

/// Narrow an internal sequence counter to the 16-bit wire field.
///
/// Sequence numbers are never wrapped: a transfer that runs past 65535 fails
/// instead of silently reusing numbers still meaningful to the peer.
pub fn wire_seq(seq: u32) -> Result<u16, PacketError> {
    u16::try_from(seq).map_err(|_| PacketError::SequenceExhausted(seq))
}

/// Framing errors raised while parsing or building a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the 3-byte header")]
    TooShort(usize),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes exceeds the 4096-byte limit")]
    PayloadTooLarge(usize),
    #[error("sequence number {0} does not fit the 16-bit wire field")]
    SequenceExhausted(u32),
}
