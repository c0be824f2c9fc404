//! Frame header codec.
//!
//! A frame is an 8-byte header followed by `length` payload bytes. The
//! stream id is shifted left one bit and its low bit set, so the first byte
//! of any real frame is odd; an even byte at a frame boundary marks the rest
//! of the packet as padding. All integers are little-endian.

use crate::error::{Error, Result};

pub(crate) const HEADER_SIZE: usize = 8;

/// Stream ids below this are reserved for the protocol; id 0 is the
/// keepalive frame.
pub(crate) const MIN_STREAM_ID: u32 = 1 << 8;

/// First frame carried on a stream; tells the peer to create it.
pub(crate) const FLAG_FIRST: u16 = 1 << 0;
/// Final frame of a stream; graceful close.
pub(crate) const FLAG_LAST: u16 = 1 << 1;
/// Payload is a UTF-8 error reason. Only valid alongside `FLAG_LAST`.
pub(crate) const FLAG_ERROR: u16 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub id: u32,
    pub length: u16,
    pub flags: u16,
}

impl FrameHeader {
    pub const KEEPALIVE: FrameHeader = FrameHeader {
        id: 0,
        length: 0,
        flags: 0,
    };

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&((self.id << 1) | 1).to_le_bytes());
        buf[4..6].copy_from_slice(&self.length.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: [u8; HEADER_SIZE]) -> Result<FrameHeader> {
        let raw = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if raw & 1 == 0 {
            // the scanner only hands us bytes whose low bit is set
            return Err(Error::Protocol("frame header within padding"));
        }
        Ok(FrameHeader {
            id: raw >> 1,
            length: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
        })
    }

    pub fn is_keepalive(&self) -> bool {
        self.id == 0
    }
}
