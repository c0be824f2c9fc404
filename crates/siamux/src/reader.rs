//! Packet reader: a decrypted byte-stream view of incoming packets.
//!
//! Pulls exactly one packet at a time from the transport, opens it in place,
//! and lets the frame scanner consume the plaintext. Frames are packed
//! back-to-back in the plaintext stream and may span packet boundaries; a
//! byte with a clear low bit at a frame boundary means the remainder of the
//! current packet is padding.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cipher::{SeqCipher, TAG_SIZE};
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, HEADER_SIZE};

pub(crate) struct PacketReader<R> {
    transport: R,
    open: SeqCipher,
    packet_size: usize,
    max_payload: usize,
    buf: Vec<u8>,
    /// Consumed prefix of the current packet's plaintext.
    pos: usize,
    /// End of the current packet's plaintext; zero until the first packet.
    end: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(transport: R, open: SeqCipher, packet_size: usize, max_payload: usize) -> Self {
        PacketReader {
            transport,
            open,
            packet_size,
            max_payload,
            buf: vec![0u8; packet_size],
            pos: 0,
            end: 0,
        }
    }

    /// Pull the next packet off the transport and open it in place.
    async fn advance_packet(&mut self) -> Result<()> {
        self.buf.resize(self.packet_size, 0);
        self.transport
            .read_exact(&mut self.buf)
            .await
            .map_err(Error::from_io)?;
        self.open.open_in_place(&mut self.buf)?;
        self.pos = 0;
        self.end = self.packet_size - TAG_SIZE;
        Ok(())
    }

    /// Copy `out.len()` decrypted bytes, crossing packet boundaries as
    /// needed.
    async fn read_plaintext(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos == self.end {
                self.advance_packet().await?;
            }
            let n = (out.len() - filled).min(self.end - self.pos);
            out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }

    /// Scan to the next frame, returning its header and payload. The
    /// payload borrows the internal packet buffer when it lies within the
    /// current packet, and `scratch` when it had to be reassembled across
    /// packets; either way it is valid only until the next call.
    pub async fn next_frame<'a>(
        &'a mut self,
        scratch: &'a mut Vec<u8>,
    ) -> Result<(FrameHeader, &'a [u8])> {
        // skip padding until positioned at a frame
        loop {
            if self.pos == self.end {
                self.advance_packet().await?;
            } else if self.buf[self.pos] & 1 == 0 {
                // rest of this packet is padding
                self.pos = self.end;
            } else {
                break;
            }
        }

        let mut header = [0u8; HEADER_SIZE];
        self.read_plaintext(&mut header).await?;
        let h = FrameHeader::decode(header)?;
        let length = h.length as usize;
        if length > self.max_payload {
            return Err(Error::Protocol("frame length exceeds packet size"));
        }

        if self.end - self.pos >= length {
            let payload = &self.buf[self.pos..self.pos + length];
            self.pos += length;
            Ok((h, payload))
        } else {
            scratch.clear();
            scratch.resize(length, 0);
            self.read_plaintext(scratch).await?;
            Ok((h, &scratch[..]))
        }
    }
}
