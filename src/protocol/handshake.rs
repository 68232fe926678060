//! Encryption upgrade key exchange (x25519 + SHA-256 + XChaCha20-Poly1305).
//!
//! The client opens with an ephemeral public key, a nonce and a timestamp. The
//! server checks freshness and the replay cache, derives a key-encryption key
//! from the ECDH shared secret and both nonces, and uses it to wrap a freshly
//! generated session key. Each side proves it saw the other's nonce by
//! returning its SHA-256 hash.
//!
//! ```text
//! client                                   server
//!   PublicKey{pk_c, n_c, ts}  ───────────▶
//!                             ◀───────────  KeyExchange{pk_s, n_s, H(n_c), wrap(k)}   [ASYMMETRIC]
//!   Confirm{H(n_s)}           ───────────▶                                           [SYMMETRIC]
//! ```
//!
//! State lives in per-connection structs that are zeroized on drop, so
//! concurrent upgrades never share secrets.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::UpgradeMessage;
use crate::utils::crypto::Crypto;
use crate::utils::replay_cache::ReplayCache;
use crate::utils::time::{current_timestamp, verify_timestamp};
use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use tracing::{debug, instrument, warn};

/// Client half of an in-flight upgrade
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ClientUpgrade {
    #[zeroize(skip)]
    secret: Option<EphemeralSecret>,
    client_nonce: [u8; 16],
}

impl ClientUpgrade {
    #[cfg(test)]
    pub(crate) fn client_nonce(&self) -> &[u8; 16] {
        &self.client_nonce
    }
}

impl std::fmt::Debug for ClientUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientUpgrade").finish_non_exhaustive()
    }
}

/// Server half, kept until the client confirms
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerUpgrade {
    server_nonce: [u8; 16],
}

impl std::fmt::Debug for ServerUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerUpgrade").finish_non_exhaustive()
    }
}

fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.finalize().into()
}

/// Key-encryption key bound to the shared secret and both nonces
fn derive_wrapping_key(
    shared_secret: &SharedSecret,
    client_nonce: &[u8; 16],
    server_nonce: &[u8; 16],
) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret.as_bytes());
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    Zeroizing::new(hasher.finalize().into())
}

/// Start an upgrade on the client.
#[instrument]
pub fn client_upgrade_init() -> Result<(ClientUpgrade, UpgradeMessage)> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let client_nonce = generate_nonce();
    let timestamp = current_timestamp()?;

    debug!("client starting encryption upgrade");
    Ok((
        ClientUpgrade {
            secret: Some(secret),
            client_nonce,
        },
        UpgradeMessage::PublicKey {
            public: public.to_bytes(),
            nonce: client_nonce,
            timestamp,
        },
    ))
}

/// Answer a client's public key with a wrapped session key.
///
/// Returns the server state, the session key to install after sending, and
/// the `KeyExchange` message.
#[instrument(skip(client_public, client_nonce, replay_cache))]
pub fn server_upgrade_respond(
    client_public: [u8; 32],
    client_nonce: [u8; 16],
    client_timestamp: u64,
    peer: &str,
    max_age_seconds: u64,
    replay_cache: &mut ReplayCache,
) -> Result<(ServerUpgrade, Zeroizing<[u8; 32]>, UpgradeMessage)> {
    if !verify_timestamp(client_timestamp, max_age_seconds) {
        warn!(peer, "stale upgrade timestamp");
        return Err(ProtocolError::HandshakeError(
            constants::ERR_INVALID_TIMESTAMP.into(),
        ));
    }
    replay_cache.check_and_record(peer, &client_nonce, client_timestamp)?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let server_nonce = generate_nonce();

    let shared = secret.diffie_hellman(&PublicKey::from(client_public));
    let kek = derive_wrapping_key(&shared, &client_nonce, &server_nonce);

    let session_key = Zeroizing::new(Crypto::generate_key()?);
    let wrapped = Crypto::new(&kek).seal(session_key.as_ref())?;

    debug!(peer, "server wrapped session key");
    Ok((
        ServerUpgrade { server_nonce },
        session_key,
        UpgradeMessage::KeyExchange {
            public: public.to_bytes(),
            nonce: server_nonce,
            nonce_verification: hash_nonce(&client_nonce),
            wrapped_key: Bytes::from(wrapped),
        },
    ))
}

/// Verify the server's answer, unwrap the session key and build the
/// confirmation.
#[instrument(skip_all)]
pub fn client_upgrade_accept(
    mut state: ClientUpgrade,
    server_public: [u8; 32],
    server_nonce: [u8; 16],
    nonce_verification: [u8; 32],
    wrapped_key: &[u8],
) -> Result<(Zeroizing<[u8; 32]>, UpgradeMessage)> {
    if hash_nonce(&state.client_nonce) != nonce_verification {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_NONCE_VERIFICATION_FAILED.into(),
        ));
    }

    let secret = state.secret.take().ok_or_else(|| {
        ProtocolError::HandshakeError(constants::ERR_CLIENT_SECRET_NOT_FOUND.into())
    })?;
    let shared = secret.diffie_hellman(&PublicKey::from(server_public));
    let kek = derive_wrapping_key(&shared, &state.client_nonce, &server_nonce);

    let unwrapped = Zeroizing::new(Crypto::new(&kek).open(wrapped_key)?);
    let key: [u8; 32] = unwrapped.as_slice().try_into().map_err(|_| {
        ProtocolError::HandshakeError(constants::ERR_INVALID_WRAPPED_KEY.into())
    })?;

    debug!("client unwrapped session key");
    Ok((
        Zeroizing::new(key),
        UpgradeMessage::Confirm {
            nonce_verification: hash_nonce(&server_nonce),
        },
    ))
}

/// Check the client's proof of the server nonce.
#[instrument(skip_all)]
pub fn server_upgrade_finalize(state: &ServerUpgrade, nonce_verification: [u8; 32]) -> Result<()> {
    if hash_nonce(&state.server_nonce) != nonce_verification {
        return Err(ProtocolError::HandshakeError(
            constants::ERR_SERVER_VERIFICATION_FAILED.into(),
        ));
    }
    debug!("server finalized encryption upgrade");
    Ok(())
}
