//! Typed messages and their body layouts.
//!
//! A packet body is a [`PacketMeta`] followed by the kind-specific fields of one
//! [`Message`]. The packet kind in the header selects the decoder, so bodies
//! carry no discriminant of their own.

use crate::config::EncryptionPolicy;
use crate::core::buffer::{ByteReader, ByteWriter};
use crate::core::packet::PacketKind;
use crate::core::value::SerializedData;
use crate::error::{ProtocolError, Result};
use crate::replication::spawn::ObjectManagement;
use crate::replication::syncvar::SyncVarUpdate;
use crate::rpc::invoke::{RpcCall, RpcResult};
use crate::stream::mux::StreamMessage;
use crate::ConnectionId;
use bytes::Bytes;

/// Source id used before the server has assigned one
pub const UNASSIGNED_ID: ConnectionId = u32::MAX;

/// A type with a fixed body layout
pub trait WireMessage: Sized {
    fn encode(&self, w: &mut ByteWriter) -> Result<()>;
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;
}

pub(crate) fn write_values(w: &mut ByteWriter, values: &[SerializedData]) -> Result<()> {
    w.write_list(values, |w, v| v.write_to(w))
}

pub(crate) fn read_values(r: &mut ByteReader<'_>) -> Result<Vec<SerializedData>> {
    r.read_list(|r| SerializedData::read_from(r))
}

pub(crate) fn write_named_values(
    w: &mut ByteWriter,
    entries: &[(String, SerializedData)],
) -> Result<()> {
    w.write_list(entries, |w, (name, value)| {
        w.write_string(name)?;
        value.write_to(w)
    })
}

pub(crate) fn read_named_values(r: &mut ByteReader<'_>) -> Result<Vec<(String, SerializedData)>> {
    r.read_list(|r| Ok((r.read_string()?, SerializedData::read_from(r)?)))
}

pub(crate) fn write_ids(w: &mut ByteWriter, ids: &[u32]) -> Result<()> {
    w.write_list(ids, |w, id| {
        w.write_u32(*id);
        Ok(())
    })
}

pub(crate) fn read_ids(r: &mut ByteReader<'_>) -> Result<Vec<u32>> {
    r.read_list(|r| r.read_u32())
}

/// Common header carried by every body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub destination: ConnectionId,
    pub source: ConnectionId,
    /// Sender wall clock in milliseconds since the epoch
    pub sent_at: i64,
}

impl WireMessage for PacketMeta {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u32(self.destination);
        w.write_u32(self.source);
        w.write_i64(self.sent_at);
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            destination: r.read_u32()?,
            source: r.read_u32()?,
            sent_at: r.read_i64()?,
        })
    }
}

/// Initiator's opening message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub protocol_name: String,
    pub protocol_version: u32,
    pub encryption: EncryptionPolicy,
}

impl WireMessage for ClientHello {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_string(&self.protocol_name)?;
        w.write_u32(self.protocol_version);
        w.write_u8(self.encryption.to_wire());
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            protocol_name: r.read_string()?,
            protocol_version: r.read_u32()?,
            encryption: EncryptionPolicy::from_wire(r.read_u8()?)?,
        })
    }
}

/// Acceptor's answer to [`ClientHello`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub accepted: bool,
    /// Why the connection was refused; empty when accepted
    pub reason: String,
    pub client_id: ConnectionId,
    /// An encryption upgrade follows
    pub upgrade: bool,
    /// The client opens authentication
    pub auth_client_initiates: bool,
    pub protocol_name: String,
    pub protocol_version: u32,
}

impl ServerHello {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            client_id: UNASSIGNED_ID,
            upgrade: false,
            auth_client_initiates: false,
            protocol_name: String::new(),
            protocol_version: 0,
        }
    }
}

impl WireMessage for ServerHello {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_bool(self.accepted);
        w.write_string(&self.reason)?;
        w.write_u32(self.client_id);
        w.write_bool(self.upgrade);
        w.write_bool(self.auth_client_initiates);
        w.write_string(&self.protocol_name)?;
        w.write_u32(self.protocol_version);
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            accepted: r.read_bool()?,
            reason: r.read_string()?,
            client_id: r.read_u32()?,
            upgrade: r.read_bool()?,
            auth_client_initiates: r.read_bool()?,
            protocol_name: r.read_string()?,
            protocol_version: r.read_u32()?,
        })
    }
}

/// Authentication exchange; payloads are opaque to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    /// Opening bytes from the initiating side
    Challenge { payload: Bytes },
    /// Responder's verdict on the challenge and its answer
    Response {
        approved: bool,
        message: String,
        payload: Bytes,
    },
    /// Initiator's final decision
    Outcome { approved: bool, message: String },
}

impl WireMessage for AuthMessage {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            AuthMessage::Challenge { payload } => {
                w.write_u8(0);
                w.write_blob(payload)
            }
            AuthMessage::Response {
                approved,
                message,
                payload,
            } => {
                w.write_u8(1);
                w.write_bool(*approved);
                w.write_string(message)?;
                w.write_blob(payload)
            }
            AuthMessage::Outcome { approved, message } => {
                w.write_u8(2);
                w.write_bool(*approved);
                w.write_string(message)
            }
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(AuthMessage::Challenge {
                payload: Bytes::copy_from_slice(r.read_blob()?),
            }),
            1 => Ok(AuthMessage::Response {
                approved: r.read_bool()?,
                message: r.read_string()?,
                payload: Bytes::copy_from_slice(r.read_blob()?),
            }),
            2 => Ok(AuthMessage::Outcome {
                approved: r.read_bool()?,
                message: r.read_string()?,
            }),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown authentication step {other}"
            ))),
        }
    }
}

/// Key exchange steps of the encryption upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeMessage {
    /// Client ephemeral public key
    PublicKey {
        public: [u8; 32],
        nonce: [u8; 16],
        timestamp: u64,
    },
    /// Server ephemeral public key and the wrapped session key
    KeyExchange {
        public: [u8; 32],
        nonce: [u8; 16],
        nonce_verification: [u8; 32],
        wrapped_key: Bytes,
    },
    /// Client proof that it unwrapped the session key
    Confirm { nonce_verification: [u8; 32] },
}

impl WireMessage for UpgradeMessage {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            UpgradeMessage::PublicKey {
                public,
                nonce,
                timestamp,
            } => {
                w.write_u8(0);
                w.write_raw(public);
                w.write_raw(nonce);
                w.write_u64(*timestamp);
                Ok(())
            }
            UpgradeMessage::KeyExchange {
                public,
                nonce,
                nonce_verification,
                wrapped_key,
            } => {
                w.write_u8(1);
                w.write_raw(public);
                w.write_raw(nonce);
                w.write_raw(nonce_verification);
                w.write_blob(wrapped_key)
            }
            UpgradeMessage::Confirm { nonce_verification } => {
                w.write_u8(2);
                w.write_raw(nonce_verification);
                Ok(())
            }
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(UpgradeMessage::PublicKey {
                public: r.read_fixed()?,
                nonce: r.read_fixed()?,
                timestamp: r.read_u64()?,
            }),
            1 => Ok(UpgradeMessage::KeyExchange {
                public: r.read_fixed()?,
                nonce: r.read_fixed()?,
                nonce_verification: r.read_fixed()?,
                wrapped_key: Bytes::copy_from_slice(r.read_blob()?),
            }),
            2 => Ok(UpgradeMessage::Confirm {
                nonce_verification: r.read_fixed()?,
            }),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown upgrade step {other}"
            ))),
        }
    }
}

/// Connection state notice; currently only sent when closing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNotice {
    pub code: u8,
    pub reason: String,
}

impl StateNotice {
    pub const DISCONNECTING: u8 = 0;

    pub fn disconnecting(reason: impl Into<String>) -> Self {
        Self {
            code: Self::DISCONNECTING,
            reason: reason.into(),
        }
    }
}

impl WireMessage for StateNotice {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u8(self.code);
        w.write_string(&self.reason)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            code: r.read_u8()?,
            reason: r.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMapping {
    pub entries: Vec<(u16, String)>,
}

impl WireMessage for PacketMapping {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_list(&self.entries, |w, (id, name)| {
            w.write_u16(*id);
            w.write_string(name)
        })
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            entries: r.read_list(|r| Ok((r.read_u16()?, r.read_string()?)))?,
        })
    }
}

/// Application-defined packet, still encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomPayload {
    pub id: u16,
    pub payload: Bytes,
}

impl WireMessage for CustomPayload {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u16(self.id);
        w.write_blob(&self.payload)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.read_u16()?,
            payload: Bytes::copy_from_slice(r.read_blob()?),
        })
    }
}

/// Every message the protocol carries
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Readiness { ready: bool },
    ConnectionState(StateNotice),
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    Authentication(AuthMessage),
    EncryptionUpgrade(UpgradeMessage),
    KeepAlive { timestamp: i64, reply: bool },
    RpcCall(RpcCall),
    RpcResult(RpcResult),
    ObjectManagement(ObjectManagement),
    SyncVarUpdate(SyncVarUpdate),
    Stream(StreamMessage),
    PacketMapping(PacketMapping),
    Custom(CustomPayload),
}

impl Message {
    pub fn kind(&self) -> PacketKind {
        match self {
            Message::Readiness { .. } => PacketKind::Readiness,
            Message::ConnectionState(_) => PacketKind::ConnectionState,
            Message::ClientHello(_) => PacketKind::ClientHandshake,
            Message::ServerHello(_) => PacketKind::ServerHandshake,
            Message::Authentication(_) => PacketKind::Authentication,
            Message::EncryptionUpgrade(_) => PacketKind::EncryptionUpgrade,
            Message::KeepAlive { .. } => PacketKind::KeepAlive,
            Message::RpcCall(_) => PacketKind::RpcCall,
            Message::RpcResult(_) => PacketKind::RpcResult,
            Message::ObjectManagement(_) => PacketKind::ObjectManagement,
            Message::SyncVarUpdate(_) => PacketKind::SyncVarUpdate,
            Message::Stream(_) => PacketKind::StreamData,
            Message::PacketMapping(_) => PacketKind::PacketMapping,
            Message::Custom(_) => PacketKind::Custom,
        }
    }

    /// Messages that belong to the application rather than the handshake
    pub fn is_application(&self) -> bool {
        !self.kind().is_handshake()
    }

    pub fn encode_body(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            Message::Readiness { ready } => {
                w.write_bool(*ready);
                Ok(())
            }
            Message::ConnectionState(m) => m.encode(w),
            Message::ClientHello(m) => m.encode(w),
            Message::ServerHello(m) => m.encode(w),
            Message::Authentication(m) => m.encode(w),
            Message::EncryptionUpgrade(m) => m.encode(w),
            Message::KeepAlive { timestamp, reply } => {
                w.write_i64(*timestamp);
                w.write_bool(*reply);
                Ok(())
            }
            Message::RpcCall(m) => m.encode(w),
            Message::RpcResult(m) => m.encode(w),
            Message::ObjectManagement(m) => m.encode(w),
            Message::SyncVarUpdate(m) => m.encode(w),
            Message::Stream(m) => m.encode(w),
            Message::PacketMapping(m) => m.encode(w),
            Message::Custom(m) => m.encode(w),
        }
    }

    pub fn decode_body(kind: PacketKind, r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match kind {
            PacketKind::Readiness => Message::Readiness {
                ready: r.read_bool()?,
            },
            PacketKind::ConnectionState => Message::ConnectionState(StateNotice::decode(r)?),
            PacketKind::ClientHandshake => Message::ClientHello(ClientHello::decode(r)?),
            PacketKind::ServerHandshake => Message::ServerHello(ServerHello::decode(r)?),
            PacketKind::Authentication => Message::Authentication(AuthMessage::decode(r)?),
            PacketKind::EncryptionUpgrade => Message::EncryptionUpgrade(UpgradeMessage::decode(r)?),
            PacketKind::KeepAlive => Message::KeepAlive {
                timestamp: r.read_i64()?,
                reply: r.read_bool()?,
            },
            PacketKind::RpcCall => Message::RpcCall(RpcCall::decode(r)?),
            PacketKind::RpcResult => Message::RpcResult(RpcResult::decode(r)?),
            PacketKind::ObjectManagement => Message::ObjectManagement(ObjectManagement::decode(r)?),
            PacketKind::SyncVarUpdate => Message::SyncVarUpdate(SyncVarUpdate::decode(r)?),
            PacketKind::StreamData => Message::Stream(StreamMessage::decode(r)?),
            PacketKind::PacketMapping => Message::PacketMapping(PacketMapping::decode(r)?),
            PacketKind::Custom => Message::Custom(CustomPayload::decode(r)?),
        })
    }
}

/// A message with its common header
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub meta: PacketMeta,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes> {
        let mut w = ByteWriter::with_capacity(64);
        self.meta.encode(&mut w)?;
        self.message.encode_body(&mut w)?;
        Ok(w.into_bytes())
    }

    /// Decode a plaintext body; every byte must be consumed
    pub fn decode(kind: PacketKind, body: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(body);
        let meta = PacketMeta::decode(&mut r)?;
        let message = Message::decode_body(kind, &mut r)?;
        r.finish()?;
        Ok(Self { meta, message })
    }
}
