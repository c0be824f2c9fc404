//! Connection settings negotiated during the handshake.

use std::time::Duration;

use crate::error::{Error, Result};

/// Wire size of the encoded settings (packet size + max timeout, both u32).
pub(crate) const SETTINGS_SIZE: usize = 8;

/// Parameters governing a session, exchanged (encrypted) during the
/// handshake. Each side proposes its own; the session uses the element-wise
/// minimum of the two proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Size of every encrypted packet on the wire, in bytes.
    pub packet_size: u32,
    /// Upper bound on connection idle time, in milliseconds. The writer
    /// emits a keepalive after 75% of this with no outgoing traffic.
    pub max_timeout_ms: u32,
}

impl Settings {
    pub const MIN_PACKET_SIZE: u32 = 1220;
    pub const MAX_PACKET_SIZE: u32 = 32768;
    pub const MIN_TIMEOUT_MS: u32 = 2 * 60 * 1000;
    pub const MAX_TIMEOUT_MS: u32 = 2 * 60 * 60 * 1000;

    /// Number of plaintext bytes carried by one packet.
    pub(crate) fn max_frame_size(&self) -> usize {
        self.packet_size as usize - crate::cipher::TAG_SIZE
    }

    /// Largest payload a single frame may carry.
    pub(crate) fn max_payload_size(&self) -> usize {
        self.max_frame_size() - crate::frame::HEADER_SIZE
    }

    pub(crate) fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms as u64 * 3 / 4)
    }

    /// Reject settings outside the protocol bounds.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.packet_size < Self::MIN_PACKET_SIZE {
            return Err(Error::UnacceptableSettings("packet size too small"));
        }
        if self.packet_size > Self::MAX_PACKET_SIZE {
            return Err(Error::UnacceptableSettings("packet size too large"));
        }
        if self.max_timeout_ms < Self::MIN_TIMEOUT_MS {
            return Err(Error::UnacceptableSettings("timeout too short"));
        }
        if self.max_timeout_ms > Self::MAX_TIMEOUT_MS {
            return Err(Error::UnacceptableSettings("timeout too long"));
        }
        Ok(())
    }

    /// Combine our settings with the peer's. Both parameters take the
    /// minimum of the two proposals.
    pub(crate) fn merge(&self, theirs: &Settings) -> Result<Settings> {
        let merged = Settings {
            packet_size: self.packet_size.min(theirs.packet_size),
            max_timeout_ms: self.max_timeout_ms.min(theirs.max_timeout_ms),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub(crate) fn encode(&self) -> [u8; SETTINGS_SIZE] {
        let mut buf = [0u8; SETTINGS_SIZE];
        buf[0..4].copy_from_slice(&self.packet_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.max_timeout_ms.to_le_bytes());
        buf
    }

    pub(crate) fn decode(buf: &[u8; SETTINGS_SIZE]) -> Settings {
        Settings {
            packet_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            max_timeout_ms: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            packet_size: 1440,
            max_timeout_ms: 20 * 60 * 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn roundtrip() {
        let s = Settings {
            packet_size: 4096,
            max_timeout_ms: 300_000,
        };
        assert_eq!(Settings::decode(&s.encode()), s);
    }

    #[test]
    fn merge_takes_minimum() {
        let a = Settings {
            packet_size: 1440,
            max_timeout_ms: 600_000,
        };
        let b = Settings {
            packet_size: 1220,
            max_timeout_ms: 1_200_000,
        };
        let m = a.merge(&b).unwrap();
        assert_eq!(m.packet_size, 1220);
        assert_eq!(m.max_timeout_ms, 600_000);
    }

    #[test]
    fn merge_rejects_out_of_bounds() {
        let a = Settings::default();
        let b = Settings {
            packet_size: 100,
            max_timeout_ms: 600_000,
        };
        assert!(matches!(
            a.merge(&b),
            Err(Error::UnacceptableSettings(_))
        ));
    }
}
