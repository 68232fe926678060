//! Pluggable authentication.
//!
//! The core only sequences the exchange; challenge and response bytes are
//! opaque. One side (chosen by [`AuthenticationProvider::client_initiates`])
//! calls `begin` and sends a challenge, the other side answers through
//! `authenticate`, and the initiator makes the final call with
//! `handle_result`. A rejection at either step closes the connection with the
//! rejection message as reason.

use crate::error::{ProtocolError, Result};
use crate::utils::locks;
use crate::ConnectionId;
use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Approved,
    Rejected(String),
}

impl AuthDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, AuthDecision::Approved)
    }
}

/// Responder's answer to a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub decision: AuthDecision,
    pub response: Bytes,
}

pub trait AuthenticationProvider: Send + Sync + 'static {
    /// Whether the client sends the first challenge
    fn client_initiates(&self) -> bool;

    /// Initiator: produce the opening challenge for `connection`
    fn begin(&self, connection: ConnectionId) -> Result<Bytes>;

    /// Responder: judge the challenge and produce response bytes
    fn authenticate(&self, connection: ConnectionId, challenge: &[u8]) -> Result<AuthOutcome>;

    /// Initiator: final decision once the responder has answered
    fn handle_result(
        &self,
        connection: ConnectionId,
        approved: bool,
        response: &[u8],
    ) -> Result<AuthDecision>;

    /// Drop any per-connection state; called once the connection is gone
    fn forget(&self, _connection: ConnectionId) {}
}

/// Approves every connection
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthentication;

impl AuthenticationProvider for NoAuthentication {
    fn client_initiates(&self) -> bool {
        false
    }

    fn begin(&self, _connection: ConnectionId) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    fn authenticate(&self, _connection: ConnectionId, _challenge: &[u8]) -> Result<AuthOutcome> {
        Ok(AuthOutcome {
            decision: AuthDecision::Approved,
            response: Bytes::new(),
        })
    }

    fn handle_result(
        &self,
        _connection: ConnectionId,
        approved: bool,
        _response: &[u8],
    ) -> Result<AuthDecision> {
        Ok(if approved {
            AuthDecision::Approved
        } else {
            AuthDecision::Rejected("peer refused authentication".into())
        })
    }
}

/// Challenge-response over a pre-shared secret.
///
/// The server sends a random nonce; the client answers with
/// `SHA-256(secret || nonce)`. Both peers construct it with the same secret.
pub struct SharedSecretAuthenticator {
    secret: Vec<u8>,
    outstanding: Mutex<HashMap<ConnectionId, [u8; 16]>>,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    fn digest(&self, nonce: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(nonce);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for SharedSecretAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuthenticator")
            .finish_non_exhaustive()
    }
}

impl AuthenticationProvider for SharedSecretAuthenticator {
    fn client_initiates(&self) -> bool {
        false
    }

    fn begin(&self, connection: ConnectionId) -> Result<Bytes> {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        locks::lock(&self.outstanding)?.insert(connection, nonce);
        Ok(Bytes::copy_from_slice(&nonce))
    }

    fn authenticate(&self, _connection: ConnectionId, challenge: &[u8]) -> Result<AuthOutcome> {
        if challenge.len() != 16 {
            return Ok(AuthOutcome {
                decision: AuthDecision::Rejected("malformed challenge".into()),
                response: Bytes::new(),
            });
        }
        Ok(AuthOutcome {
            decision: AuthDecision::Approved,
            response: Bytes::copy_from_slice(&self.digest(challenge)),
        })
    }

    fn handle_result(
        &self,
        connection: ConnectionId,
        approved: bool,
        response: &[u8],
    ) -> Result<AuthDecision> {
        let nonce = locks::lock(&self.outstanding)?
            .remove(&connection)
            .ok_or_else(|| ProtocolError::HandshakeError("no outstanding challenge".into()))?;
        if !approved {
            return Ok(AuthDecision::Rejected("peer refused the challenge".into()));
        }
        if bool::from(response.ct_eq(self.digest(&nonce).as_slice())) {
            debug!(connection_id = connection, "shared secret verified");
            Ok(AuthDecision::Approved)
        } else {
            Ok(AuthDecision::Rejected("invalid credentials".into()))
        }
    }

    fn forget(&self, connection: ConnectionId) {
        if let Ok(mut outstanding) = locks::lock(&self.outstanding) {
            outstanding.remove(&connection);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_accepts_matching_peer() {
        let server = SharedSecretAuthenticator::new("hunter2");
        let client = SharedSecretAuthenticator::new("hunter2");
        let challenge = server.begin(5).unwrap();
        let outcome = client.authenticate(5, &challenge).unwrap();
        assert!(outcome.decision.is_approved());
        assert_eq!(
            server.handle_result(5, true, &outcome.response).unwrap(),
            AuthDecision::Approved
        );
    }

    #[test]
    fn test_shared_secret_rejects_wrong_secret() {
        let server = SharedSecretAuthenticator::new("hunter2");
        let client = SharedSecretAuthenticator::new("letmein");
        let challenge = server.begin(5).unwrap();
        let outcome = client.authenticate(5, &challenge).unwrap();
        assert!(matches!(
            server.handle_result(5, true, &outcome.response).unwrap(),
            AuthDecision::Rejected(_)
        ));
    }

    #[test]
    fn test_challenge_is_single_use() {
        let server = SharedSecretAuthenticator::new("s");
        let challenge = server.begin(1).unwrap();
        let outcome = server.authenticate(1, &challenge).unwrap();
        server.handle_result(1, true, &outcome.response).unwrap();
        assert!(server.handle_result(1, true, &outcome.response).is_err());
    }

    #[test]
    fn test_forget_drops_outstanding_challenge() {
        let server = SharedSecretAuthenticator::new("s");
        let challenge = server.begin(3).unwrap();
        let outcome = server.authenticate(3, &challenge).unwrap();
        server.forget(3);
        assert!(locks::lock(&server.outstanding).unwrap().is_empty());
        assert!(server.handle_result(3, true, &outcome.response).is_err());
    }

    #[test]
    fn test_truncated_response_rejected() {
        let server = SharedSecretAuthenticator::new("s");
        let challenge = server.begin(2).unwrap();
        let outcome = server.authenticate(2, &challenge).unwrap();
        assert!(matches!(
            server.handle_result(2, true, &outcome.response[..16]).unwrap(),
            AuthDecision::Rejected(_)
        ));
    }

    #[test]
    fn test_no_authentication_approves() {
        let auth = NoAuthentication;
        let outcome = auth.authenticate(1, &auth.begin(1).unwrap()).unwrap();
        assert!(outcome.decision.is_approved());
        assert!(auth.handle_result(1, true, &[]).unwrap().is_approved());
    }
}
