//! # Error Types
//!
//! Error handling for every layer of the protocol, from framing up to object
//! replication.
//!
//! ## Error Categories
//! - **Connection-fatal**: framing violations, handshake failures, crypto
//!   failures, timeouts and I/O errors. The owning connection is torn down and
//!   the error text becomes the disconnect reason.
//! - **Message-scoped**: serialization mismatches, unresolved references,
//!   permission failures and calls against inactive objects. Only the triggering
//!   message is affected; RPC callers receive a failed result.
//! - **Startup**: packet id collisions and configuration errors, raised while the
//!   registries are built.
//!
//! ## Example Usage
//! ```rust
//! use synclink::error::{ProtocolError, Result};
//!
//! fn check(id: u32) -> Result<u32> {
//!     if id == 0 {
//!         return Err(ProtocolError::UnresolvedReference { kind: "object", id });
//!     }
//!     Ok(id)
//! }
//!
//! assert!(check(0).is_err());
//! assert!(!check(0).unwrap_err().is_fatal());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_INVALID_HEADER: &str = "Invalid packet header";
    pub const ERR_TRUNCATED_BODY: &str = "Packet body shorter than declared size";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after message body";
    pub const ERR_PLAINTEXT_AFTER_UPGRADE: &str =
        "Plaintext packet received on an encrypted connection";
    pub const ERR_ENCRYPTED_BEFORE_UPGRADE: &str =
        "Encrypted packet received before key exchange completed";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NOT_CONNECTED: &str = "Connection is not ready";
    pub const ERR_SERVER_FULL: &str = "Server has no free connection slots";

    /// Cryptographic errors
    pub const ERR_ENCRYPTION_FAILED: &str = "Encryption failed";
    pub const ERR_DECRYPTION_FAILED: &str = "Decryption failed";

    /// Handshake errors
    pub const ERR_UNEXPECTED_MESSAGE: &str = "Unexpected message for connection state";
    pub const ERR_ENCRYPTION_POLICY_MISMATCH: &str =
        "Encryption policies of client and server are incompatible";
    pub const ERR_PACKET_MAPPING_MISMATCH: &str = "Custom packet mapping mismatch";
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_REPLAY_ATTACK: &str = "Replay detected - nonce/timestamp already seen";
    pub const ERR_CLIENT_NONCE_NOT_FOUND: &str = "Client nonce not found";
    pub const ERR_SERVER_NONCE_NOT_FOUND: &str = "Server nonce not found";
    pub const ERR_CLIENT_SECRET_NOT_FOUND: &str = "Client secret not found";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Server failed to verify client nonce";
    pub const ERR_SERVER_VERIFICATION_FAILED: &str = "Client failed to verify server nonce";
    pub const ERR_INVALID_WRAPPED_KEY: &str = "Wrapped session key has an invalid length";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Invalid packet flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("Unknown packet kind: {0}")]
    UnknownPacketKind(u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unresolved {kind} reference: {id}")]
    UnresolvedReference { kind: &'static str, id: u32 },

    #[error("Packet id {id} already registered for '{existing}', cannot register '{new}'")]
    PacketIdCollision {
        id: u16,
        existing: String,
        new: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network object {0} is inactive")]
    ObjectInactive(u32),

    #[error("Circular dependency involving network object {0}")]
    CircularDependency(u32),

    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Keep-alive timed out")]
    KeepAliveTimeout,

    #[error("Unsupported protocol {name} v{version}")]
    UnsupportedProtocol { name: String, version: u32 },

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection {0} is not connected")]
    NotConnected(u32),

    #[error("Remote call failed: {0}")]
    RpcFailed(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Remote call {0} was cancelled")]
    CallCancelled(u32),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Message-scoped errors (serialization, references, permissions, inactive
    /// objects, failed calls) leave the connection intact.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Framing(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::InvalidFlags(_)
                | ProtocolError::UnknownPacketKind(_)
                | ProtocolError::AuthenticationRejected(_)
                | ProtocolError::HandshakeError(_)
                | ProtocolError::HandshakeTimeout
                | ProtocolError::KeepAliveTimeout
                | ProtocolError::UnsupportedProtocol { .. }
                | ProtocolError::SecurityError(_)
                | ProtocolError::DecryptionFailure
                | ProtocolError::EncryptionFailure
                | ProtocolError::DecompressionFailure
                | ProtocolError::ConnectionClosed
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
