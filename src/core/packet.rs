//! Packet header, kinds and flags.
//!
//! Every packet starts with a fixed six-byte header:
//!
//! ```text
//! [size: u32 BE] [kind: u8] [flags: u8] [body: size bytes]
//! ```
//!
//! `size` counts the body only, so a reader that has the header knows exactly
//! how many more bytes to buffer before the packet is complete.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Fixed header width in bytes
pub const HEADER_LEN: usize = 6;

/// Kinds of packet carried on a connection
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Readiness = 1,
    ConnectionState = 2,
    ClientHandshake = 3,
    ServerHandshake = 4,
    RpcCall = 5,
    RpcResult = 6,
    Authentication = 7,
    EncryptionUpgrade = 8,
    KeepAlive = 9,
    ObjectManagement = 10,
    SyncVarUpdate = 11,
    StreamData = 12,
    PacketMapping = 13,
    /// Application packet resolved through its registered 16-bit id
    Custom = 64,
}

impl PacketKind {
    pub fn from_u8(raw: u8) -> Result<Self> {
        use PacketKind::*;
        Ok(match raw {
            1 => Readiness,
            2 => ConnectionState,
            3 => ClientHandshake,
            4 => ServerHandshake,
            5 => RpcCall,
            6 => RpcResult,
            7 => Authentication,
            8 => EncryptionUpgrade,
            9 => KeepAlive,
            10 => ObjectManagement,
            11 => SyncVarUpdate,
            12 => StreamData,
            13 => PacketMapping,
            64 => Custom,
            other => return Err(ProtocolError::UnknownPacketKind(other)),
        })
    }

    /// Kinds that may travel before the connection is established
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketKind::ClientHandshake
                | PacketKind::ServerHandshake
                | PacketKind::Authentication
                | PacketKind::EncryptionUpgrade
                | PacketKind::PacketMapping
                | PacketKind::Readiness
                | PacketKind::ConnectionState
                | PacketKind::KeepAlive
        )
    }
}

/// Bitset of body transformations
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Body is compressed
    pub const COMPRESSED: PacketFlags = PacketFlags(0x01);
    /// Body belongs to the asymmetric key exchange
    pub const ASYMMETRIC: PacketFlags = PacketFlags(0x02);
    /// Body is sealed with the session key
    pub const SYMMETRIC: PacketFlags = PacketFlags(0x04);
    /// With `COMPRESSED`: Zstd instead of LZ4
    pub const ZSTD: PacketFlags = PacketFlags(0x08);

    const KNOWN: u8 = 0x0F;

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Accept raw bits only if they form a valid combination
    pub fn from_bits(bits: u8) -> Result<Self> {
        let flags = PacketFlags(bits);
        flags.validate()?;
        Ok(flags)
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn is_encrypted(self) -> bool {
        self.0 & (Self::ASYMMETRIC.0 | Self::SYMMETRIC.0) != 0
    }

    /// Reject unknown bits, both encryption bits at once, and a codec selector
    /// without compression.
    pub fn validate(self) -> Result<()> {
        if self.0 & !Self::KNOWN != 0
            || (self.contains(Self::ASYMMETRIC) && self.contains(Self::SYMMETRIC))
            || (self.contains(Self::ZSTD) && !self.contains(Self::COMPRESSED))
        {
            return Err(ProtocolError::InvalidFlags(self.0));
        }
        Ok(())
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::COMPRESSED) {
            names.push("COMPRESSED");
        }
        if self.contains(Self::ASYMMETRIC) {
            names.push("ASYMMETRIC");
        }
        if self.contains(Self::SYMMETRIC) {
            names.push("SYMMETRIC");
        }
        if self.contains(Self::ZSTD) {
            names.push("ZSTD");
        }
        write!(f, "PacketFlags({:#04x} {})", self.0, names.join("|"))
    }
}

/// Decoded fixed-width header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u32,
    pub kind: PacketKind,
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub fn new(kind: PacketKind, flags: PacketFlags, size: usize) -> Result<Self> {
        let size = u32::try_from(size).map_err(|_| ProtocolError::OversizedPacket(size))?;
        flags.validate()?;
        Ok(Self { size, kind, flags })
    }

    /// Read a header from the start of `data` without looking at the body.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_LEN`] bytes are available.
    pub fn peek(data: &[u8], max_body: usize) -> Result<Option<Self>> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut cursor = &data[..HEADER_LEN];
        let size = cursor.get_u32();
        let kind = cursor.get_u8();
        let flags = cursor.get_u8();

        if size as usize > max_body {
            return Err(ProtocolError::OversizedPacket(size as usize));
        }
        let kind = PacketKind::from_u8(kind)?;
        let flags = PacketFlags::from_bits(flags)?;
        Ok(Some(Self { size, kind, flags }))
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32(self.size);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flags.bits());
    }

    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.size as usize
    }
}

/// A complete packet as cut from the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn new(kind: PacketKind, flags: PacketFlags, body: Bytes) -> Result<Self> {
        let header = PacketHeader::new(kind, flags, body.len())?;
        Ok(Self { header, body })
    }

    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    pub fn flags(&self) -> PacketFlags {
        self.header.flags
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header.total_len());
        self.header.write(&mut out);
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Parse exactly one frame from `data`
    pub fn from_bytes(data: &[u8], max_body: usize) -> Result<Self> {
        let header = PacketHeader::peek(data, max_body)?.ok_or_else(|| {
            ProtocolError::Framing(crate::error::constants::ERR_INVALID_HEADER.into())
        })?;
        if data.len() != header.total_len() {
            return Err(ProtocolError::Framing(format!(
                "declared body of {} bytes, found {}",
                header.size,
                data.len() - HEADER_LEN
            )));
        }
        Ok(Self {
            header,
            body: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}
