//! Turns [`Envelope`]s into [`Frame`]s and back.
//!
//! Sealing order is encode, compress, encrypt. Opening reverses it and refuses
//! any frame whose encryption state does not match the connection.

use crate::config::TransportConfig;
use crate::core::packet::{Frame, PacketFlags};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Envelope;
use crate::utils::compression::{self, CompressionKind};
use crate::utils::crypto::Crypto;
use bytes::Bytes;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct WireFormat {
    pub compression_enabled: bool,
    pub compression_kind: CompressionKind,
    pub compression_threshold: usize,
    pub max_payload_size: usize,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl WireFormat {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            compression_enabled: config.compression_enabled,
            compression_kind: config.compression_kind,
            compression_threshold: config.compression_threshold_bytes,
            max_payload_size: config.max_payload_size,
        }
    }

    /// Encode and transform one envelope.
    ///
    /// `extra_flags` may only carry `ASYMMETRIC`; the compression and
    /// symmetric bits are decided here.
    pub fn seal(
        &self,
        envelope: &Envelope,
        extra_flags: PacketFlags,
        cipher: Option<&Crypto>,
    ) -> Result<Frame> {
        let kind = envelope.message.kind();
        let plain = envelope.encode()?;
        let mut flags = extra_flags;

        let mut body: Vec<u8> = if self.compression_enabled {
            let (out, applied) =
                compression::maybe_compress(&plain, self.compression_kind, self.compression_threshold)?;
            if applied {
                flags.insert(PacketFlags::COMPRESSED);
                if self.compression_kind == CompressionKind::Zstd {
                    flags.insert(PacketFlags::ZSTD);
                }
            }
            out
        } else {
            plain.to_vec()
        };

        if let Some(cipher) = cipher {
            if flags.contains(PacketFlags::ASYMMETRIC) {
                return Err(ProtocolError::InvalidFlags(
                    (flags | PacketFlags::SYMMETRIC).bits(),
                ));
            }
            body = cipher.seal(&body)?;
            flags.insert(PacketFlags::SYMMETRIC);
        }

        if body.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(body.len()));
        }
        trace!(?kind, ?flags, len = body.len(), "sealed packet");
        Frame::new(kind, flags, Bytes::from(body))
    }

    /// Reverse of [`WireFormat::seal`].
    ///
    /// With `require_encrypted` set, plaintext frames are refused. A symmetric
    /// frame without an installed cipher is refused regardless.
    pub fn open(
        &self,
        frame: &Frame,
        cipher: Option<&Crypto>,
        require_encrypted: bool,
    ) -> Result<Envelope> {
        let flags = frame.flags();
        flags.validate()?;

        let decrypted;
        let mut body: &[u8] = &frame.body;
        if flags.contains(PacketFlags::SYMMETRIC) {
            let cipher = cipher.ok_or_else(|| {
                ProtocolError::SecurityError(constants::ERR_ENCRYPTED_BEFORE_UPGRADE.into())
            })?;
            decrypted = cipher.open(body)?;
            body = &decrypted;
        } else if require_encrypted {
            return Err(ProtocolError::SecurityError(
                constants::ERR_PLAINTEXT_AFTER_UPGRADE.into(),
            ));
        }

        let inflated;
        if flags.contains(PacketFlags::COMPRESSED) {
            let kind = if flags.contains(PacketFlags::ZSTD) {
                CompressionKind::Zstd
            } else {
                CompressionKind::Lz4
            };
            inflated = compression::decompress(body, kind)?;
            body = &inflated;
        }

        Envelope::decode(frame.kind(), body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::message::{CustomPayload, Message, PacketMeta};

    fn envelope(payload: Vec<u8>) -> Envelope {
        Envelope {
            meta: PacketMeta {
                destination: 0,
                source: 4,
                sent_at: 10,
            },
            message: Message::Custom(CustomPayload {
                id: 1,
                payload: Bytes::from(payload),
            }),
        }
    }

    #[test]
    fn test_plain_roundtrip() {
        let wire = WireFormat::default();
        let env = envelope(b"hi".to_vec());
        let frame = wire.seal(&env, PacketFlags::NONE, None).unwrap();
        assert_eq!(frame.flags(), PacketFlags::NONE);
        assert_eq!(wire.open(&frame, None, false).unwrap(), env);
    }

    #[test]
    fn test_compressed_then_encrypted() {
        let wire = WireFormat {
            compression_enabled: true,
            compression_kind: CompressionKind::Zstd,
            compression_threshold: 16,
            ..WireFormat::default()
        };
        let key = Crypto::generate_key().unwrap();
        let cipher = Crypto::new(&key);
        let env = envelope(vec![b'a'; 4096]);

        let frame = wire.seal(&env, PacketFlags::NONE, Some(&cipher)).unwrap();
        assert!(frame.flags().contains(PacketFlags::COMPRESSED));
        assert!(frame.flags().contains(PacketFlags::ZSTD));
        assert!(frame.flags().contains(PacketFlags::SYMMETRIC));
        assert_eq!(wire.open(&frame, Some(&cipher), true).unwrap(), env);
    }

    #[test]
    fn test_plaintext_refused_after_upgrade() {
        let wire = WireFormat::default();
        let frame = wire.seal(&envelope(vec![1]), PacketFlags::NONE, None).unwrap();
        let cipher = Crypto::new(&[3u8; 32]);
        assert!(matches!(
            wire.open(&frame, Some(&cipher), true),
            Err(ProtocolError::SecurityError(_))
        ));
    }

    #[test]
    fn test_encrypted_refused_without_key() {
        let wire = WireFormat::default();
        let cipher = Crypto::new(&[3u8; 32]);
        let frame = wire
            .seal(&envelope(vec![1]), PacketFlags::NONE, Some(&cipher))
            .unwrap();
        assert!(matches!(
            wire.open(&frame, None, false),
            Err(ProtocolError::SecurityError(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let wire = WireFormat::default();
        let frame = wire
            .seal(&envelope(vec![1]), PacketFlags::NONE, Some(&Crypto::new(&[1u8; 32])))
            .unwrap();
        assert!(matches!(
            wire.open(&frame, Some(&Crypto::new(&[2u8; 32])), true),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_oversized_body_refused() {
        let wire = WireFormat {
            max_payload_size: 32,
            ..WireFormat::default()
        };
        assert!(matches!(
            wire.seal(&envelope(vec![0; 64]), PacketFlags::NONE, None),
            Err(ProtocolError::OversizedPacket(_))
        ));
    }
}
