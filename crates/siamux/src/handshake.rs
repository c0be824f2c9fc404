//! Session establishment.
//!
//! Performed over the raw transport before any packet traffic: a one-byte
//! version exchange, an ephemeral X25519 key agreement, an Ed25519 signature
//! binding the acceptor's long-term identity to both ephemeral keys, and an
//! encrypted exchange of connection settings.
//!
//! The session key is `BLAKE2b-256(shared_secret || dialer_pk || acceptor_pk)`.
//! The acceptor seals its settings with its outbound state (nonces starting
//! at `1 << 95`); the dialer replies with its own proposal sealed under the
//! zero-based partition. Both sides install the element-wise minimum of the
//! two proposals.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroize;

use crate::cipher::{derive_session_key, AeadKind, SeqCipher, TAG_SIZE};
use crate::config::{Settings, SETTINGS_SIZE};
use crate::error::{Error, Result};

/// Highest protocol version this implementation speaks.
pub(crate) const PROTOCOL_VERSION: u8 = 4;

const PUBKEY_LEN: usize = 32;
const SIG_LEN: usize = 64;
const SEALED_SETTINGS_LEN: usize = SETTINGS_SIZE + TAG_SIZE;

/// Output of a completed handshake: one sequenced cipher per direction plus
/// the merged session settings.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub seal: SeqCipher,
    pub open: SeqCipher,
    pub settings: Settings,
}

/// The well-known identity for unauthenticated sessions: an Ed25519 keypair
/// derived from an all-zero seed. Encryption only, no authentication.
pub(crate) fn anonymous_identity() -> SigningKey {
    SigningKey::from_bytes(&[0u8; 32])
}

/// Send our version byte, read the peer's, and reject peers we cannot talk
/// to.
async fn exchange_versions<T>(conn: &mut T) -> Result<u8>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(&[PROTOCOL_VERSION])
        .await
        .map_err(Error::from_io)?;
    conn.flush().await.map_err(Error::from_io)?;
    let mut version = [0u8; 1];
    conn.read_exact(&mut version).await.map_err(Error::from_io)?;
    match version[0] {
        0 => Err(Error::Protocol("peer sent protocol version 0")),
        v if v < 3 => Err(Error::UnsupportedVersion(v)),
        v => Ok(v),
    }
}

/// Dialer half of the handshake. `peer_identity` is the Ed25519 key the
/// acceptor is expected to prove possession of.
pub(crate) async fn dial<T>(
    conn: &mut T,
    peer_identity: &VerifyingKey,
    ours: Settings,
) -> Result<Handshake>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    ours.validate()?;
    let their_version = exchange_versions(conn).await?;
    let kind = AeadKind::for_peer_version(their_version);

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let our_pk = X25519Public::from(&secret);
    conn.write_all(our_pk.as_bytes())
        .await
        .map_err(Error::from_io)?;
    conn.flush().await.map_err(Error::from_io)?;

    // acceptor response: ephemeral pubkey || signature || sealed settings
    let mut resp = [0u8; PUBKEY_LEN + SIG_LEN + SEALED_SETTINGS_LEN];
    conn.read_exact(&mut resp).await.map_err(Error::from_io)?;
    let their_pk_bytes: [u8; PUBKEY_LEN] = resp[..PUBKEY_LEN].try_into().unwrap();
    let sig_bytes: [u8; SIG_LEN] = resp[PUBKEY_LEN..PUBKEY_LEN + SIG_LEN].try_into().unwrap();
    let sig = Signature::from_bytes(&sig_bytes);

    // the signature binds the peer's long-term identity to this session's
    // ephemeral keys
    let mut msg = [0u8; PUBKEY_LEN * 2];
    msg[..PUBKEY_LEN].copy_from_slice(our_pk.as_bytes());
    msg[PUBKEY_LEN..].copy_from_slice(&their_pk_bytes);
    peer_identity
        .verify(&msg, &sig)
        .map_err(|_| Error::Crypto("invalid identity signature"))?;

    let shared = secret.diffie_hellman(&X25519Public::from(their_pk_bytes));
    if !shared.was_contributory() {
        return Err(Error::Crypto("non-contributory key exchange"));
    }
    let mut key = derive_session_key(shared.as_bytes(), our_pk.as_bytes(), &their_pk_bytes);
    let mut seal = SeqCipher::new(kind, &key, false)?;
    let mut open = SeqCipher::new(kind, &key, true)?;
    key.zeroize();

    let theirs = open_settings(&mut open, &mut resp[PUBKEY_LEN + SIG_LEN..])?;
    let settings = ours.merge(&theirs)?;

    let mut sealed = [0u8; SEALED_SETTINGS_LEN];
    sealed[..SETTINGS_SIZE].copy_from_slice(&ours.encode());
    seal.seal_in_place(&mut sealed)?;
    conn.write_all(&sealed).await.map_err(Error::from_io)?;
    conn.flush().await.map_err(Error::from_io)?;

    tracing::debug!(
        peer = %hex::encode(&peer_identity.to_bytes()[..4]),
        version = their_version,
        packet_size = settings.packet_size,
        "dialer handshake complete"
    );
    Ok(Handshake {
        seal,
        open,
        settings,
    })
}

/// Acceptor half of the handshake, proving possession of `identity`.
pub(crate) async fn accept<T>(
    conn: &mut T,
    identity: &SigningKey,
    ours: Settings,
) -> Result<Handshake>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    ours.validate()?;
    let their_version = exchange_versions(conn).await?;
    let kind = AeadKind::for_peer_version(their_version);

    let mut dialer_pk_bytes = [0u8; PUBKEY_LEN];
    conn.read_exact(&mut dialer_pk_bytes)
        .await
        .map_err(Error::from_io)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let our_pk = X25519Public::from(&secret);
    let shared = secret.diffie_hellman(&X25519Public::from(dialer_pk_bytes));
    if !shared.was_contributory() {
        return Err(Error::Crypto("non-contributory key exchange"));
    }
    let mut key = derive_session_key(shared.as_bytes(), &dialer_pk_bytes, our_pk.as_bytes());
    let mut seal = SeqCipher::new(kind, &key, true)?;
    let mut open = SeqCipher::new(kind, &key, false)?;
    key.zeroize();

    let mut msg = [0u8; PUBKEY_LEN * 2];
    msg[..PUBKEY_LEN].copy_from_slice(&dialer_pk_bytes);
    msg[PUBKEY_LEN..].copy_from_slice(our_pk.as_bytes());
    let sig = identity.sign(&msg);

    let mut resp = [0u8; PUBKEY_LEN + SIG_LEN + SEALED_SETTINGS_LEN];
    resp[..PUBKEY_LEN].copy_from_slice(our_pk.as_bytes());
    resp[PUBKEY_LEN..PUBKEY_LEN + SIG_LEN].copy_from_slice(&sig.to_bytes());
    resp[PUBKEY_LEN + SIG_LEN..PUBKEY_LEN + SIG_LEN + SETTINGS_SIZE]
        .copy_from_slice(&ours.encode());
    seal.seal_in_place(&mut resp[PUBKEY_LEN + SIG_LEN..])?;
    conn.write_all(&resp).await.map_err(Error::from_io)?;
    conn.flush().await.map_err(Error::from_io)?;

    let mut sealed = [0u8; SEALED_SETTINGS_LEN];
    conn.read_exact(&mut sealed).await.map_err(Error::from_io)?;
    let theirs = open_settings(&mut open, &mut sealed)?;
    let settings = ours.merge(&theirs)?;

    tracing::debug!(
        version = their_version,
        packet_size = settings.packet_size,
        "acceptor handshake complete"
    );
    Ok(Handshake {
        seal,
        open,
        settings,
    })
}

fn open_settings(open: &mut SeqCipher, sealed: &mut [u8]) -> Result<Settings> {
    let plain = open.open_in_place(sealed)?;
    let bytes: &[u8; SETTINGS_SIZE] = plain
        .try_into()
        .map_err(|_| Error::Protocol("malformed settings"))?;
    Ok(Settings::decode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn test_identity() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[tokio::test]
    async fn roundtrip_and_merge() {
        let (mut a, mut b) = duplex(4096);
        let identity = test_identity();
        let peer = identity.verifying_key();
        let dialer_settings = Settings {
            packet_size: 1440,
            max_timeout_ms: 600_000,
        };
        let acceptor_settings = Settings {
            packet_size: 1220,
            max_timeout_ms: 1_200_000,
        };

        let acceptor =
            tokio::spawn(async move { accept(&mut b, &identity, acceptor_settings).await });
        let dialed = dial(&mut a, &peer, dialer_settings).await.unwrap();
        let accepted = acceptor.await.unwrap().unwrap();

        let expect = Settings {
            packet_size: 1220,
            max_timeout_ms: 600_000,
        };
        assert_eq!(dialed.settings, expect);
        assert_eq!(accepted.settings, expect);
    }

    #[tokio::test]
    async fn ciphers_interoperate() {
        let (mut a, mut b) = duplex(4096);
        let identity = test_identity();
        let peer = identity.verifying_key();
        let acceptor =
            tokio::spawn(async move { accept(&mut b, &identity, Settings::default()).await });
        let mut dialed = dial(&mut a, &peer, Settings::default()).await.unwrap();
        let mut accepted = acceptor.await.unwrap().unwrap();

        // dialer -> acceptor
        let mut buf = vec![3u8; 100 + TAG_SIZE];
        dialed.seal.seal_in_place(&mut buf).unwrap();
        assert_eq!(accepted.open.open_in_place(&mut buf).unwrap(), [3u8; 100]);

        // acceptor -> dialer
        let mut buf = vec![5u8; 40 + TAG_SIZE];
        accepted.seal.seal_in_place(&mut buf).unwrap();
        assert_eq!(dialed.open.open_in_place(&mut buf).unwrap(), [5u8; 40]);
    }

    #[tokio::test]
    async fn wrong_identity_rejected() {
        let (mut a, mut b) = duplex(4096);
        let identity = test_identity();
        let wrong = SigningKey::from_bytes(&[8u8; 32]).verifying_key();
        let acceptor =
            tokio::spawn(async move { accept(&mut b, &identity, Settings::default()).await });
        let err = dial(&mut a, &wrong, Settings::default()).await.unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        drop(a);
        let _ = acceptor.await;
    }

    #[tokio::test]
    async fn old_peer_rejected() {
        let (mut a, mut b) = duplex(64);
        let fake_peer = tokio::spawn(async move {
            // a v2 peer: announces its version, then goes quiet
            b.write_all(&[2]).await.unwrap();
            let mut v = [0u8; 1];
            let _ = b.read_exact(&mut v).await;
            b
        });
        let err = dial(&mut a, &test_identity().verifying_key(), Settings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(2)));
        let _ = fake_peer.await;
    }

    #[tokio::test]
    async fn anonymous_identity_is_stable() {
        let a = anonymous_identity();
        let b = anonymous_identity();
        assert_eq!(a.verifying_key(), b.verifying_key());
    }
}
