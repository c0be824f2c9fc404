//! Sequenced AEAD states for the session.
//!
//! Each direction of a session owns an independent AEAD state whose 96-bit
//! nonce is incremented after every packet sealed or opened. The dialer's
//! outbound nonces count up from zero; the acceptor's outbound nonces count
//! up from `1 << 95`, so the two directions can never collide under the
//! shared key.
//!
//! The AEAD itself depends on the peer's protocol version: ChaCha20-Poly1305
//! for version 3 peers, AES-128-GCM (first half of the derived key) for
//! version 4 and up.

use aes_gcm::Aes128Gcm;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, KeyInit};

use crate::error::{Error, Result};

pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const NONCE_SIZE: usize = 12;
pub(crate) const TAG_SIZE: usize = 16;

type Blake2b256 = Blake2b<U32>;

/// Derive the 32-byte session key from the X25519 shared secret and both
/// ephemeral public keys.
pub(crate) fn derive_session_key(
    shared_secret: &[u8; 32],
    dialer_pk: &[u8; 32],
    acceptor_pk: &[u8; 32],
) -> [u8; KEY_SIZE] {
    let mut hasher = Blake2b256::new();
    hasher.update(shared_secret);
    hasher.update(dialer_pk);
    hasher.update(acceptor_pk);
    hasher.finalize().into()
}

/// AEAD algorithm negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    ChaCha20Poly1305,
    Aes128Gcm,
}

impl AeadKind {
    /// Pick the AEAD for a peer protocol version (already validated >= 3).
    pub(crate) fn for_peer_version(version: u8) -> AeadKind {
        if version >= 4 {
            AeadKind::Aes128Gcm
        } else {
            AeadKind::ChaCha20Poly1305
        }
    }
}

enum Aead {
    ChaCha(Box<ChaCha20Poly1305>),
    Aes(Box<Aes128Gcm>),
}

impl std::fmt::Debug for Aead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Aead::ChaCha(_) => f.write_str("Aead::ChaCha(..)"),
            Aead::Aes(_) => f.write_str("Aead::Aes(..)"),
        }
    }
}

/// One direction's AEAD state: cipher instance plus the implicit,
/// monotonically advancing nonce.
#[derive(Debug)]
pub(crate) struct SeqCipher {
    aead: Aead,
    nonce: [u8; NONCE_SIZE],
}

impl SeqCipher {
    /// Instantiate a direction state. `high_partition` selects the
    /// acceptor-outbound nonce range (`1 << 95` upward).
    pub fn new(kind: AeadKind, key: &[u8; KEY_SIZE], high_partition: bool) -> Result<Self> {
        let aead = match kind {
            AeadKind::ChaCha20Poly1305 => Aead::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| Error::Crypto("cannot instantiate negotiated cipher"))?,
            )),
            AeadKind::Aes128Gcm => Aead::Aes(Box::new(
                Aes128Gcm::new_from_slice(&key[..16])
                    .map_err(|_| Error::Crypto("cannot instantiate negotiated cipher"))?,
            )),
        };
        let mut nonce = [0u8; NONCE_SIZE];
        if high_partition {
            nonce[NONCE_SIZE - 1] = 0x80;
        }
        Ok(SeqCipher { aead, nonce })
    }

    /// Seal `buf` in place. The final `TAG_SIZE` bytes of `buf` are
    /// overwritten with the authentication tag; the rest is plaintext on
    /// entry and ciphertext on return.
    pub fn seal_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        debug_assert!(buf.len() > TAG_SIZE);
        let (msg, tag_out) = buf.split_at_mut(buf.len() - TAG_SIZE);
        let nonce = GenericArray::from_slice(&self.nonce);
        let tag = match &self.aead {
            Aead::ChaCha(c) => c.encrypt_in_place_detached(nonce, &[], msg),
            Aead::Aes(c) => c.encrypt_in_place_detached(nonce, &[], msg),
        }
        .map_err(|_| Error::Crypto("packet seal failed"))?;
        tag_out.copy_from_slice(&tag);
        self.advance();
        Ok(())
    }

    /// Open `buf` (ciphertext followed by tag) in place, returning the
    /// plaintext slice. Any tamper yields `AuthFailure`.
    pub fn open_in_place<'a>(&mut self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        debug_assert!(buf.len() > TAG_SIZE);
        let (msg, tag) = buf.split_at_mut(buf.len() - TAG_SIZE);
        let nonce = GenericArray::from_slice(&self.nonce);
        let tag = GenericArray::from_slice(tag);
        let res = match &self.aead {
            Aead::ChaCha(c) => c.decrypt_in_place_detached(nonce, &[], msg, tag),
            Aead::Aes(c) => c.decrypt_in_place_detached(nonce, &[], msg, tag),
        };
        res.map_err(|_| Error::AuthFailure)?;
        self.advance();
        Ok(msg)
    }

    /// Increment the nonce. Only the low 8 bytes count; the partition bit in
    /// the top byte is untouched.
    fn advance(&mut self) {
        let ctr = u64::from_le_bytes(self.nonce[..8].try_into().unwrap()).wrapping_add(1);
        self.nonce[..8].copy_from_slice(&ctr.to_le_bytes());
    }
}
