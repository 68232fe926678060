//! Property-based tests using proptest
//!
//! Codec invariants over randomly generated values, frames and payloads.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use synclink::core::codec::FrameCodec;
use synclink::core::packet::{Frame, PacketFlags, PacketKind};
use synclink::core::value::{SerializedData, Value};
use synclink::protocol::message::{CustomPayload, Envelope, Message, PacketMeta};
use synclink::protocol::wire::WireFormat;
use synclink::utils::compression::{compress, decompress, CompressionKind};
use tokio_util::codec::{Decoder, Encoder};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Void),
        any::<bool>().prop_map(Value::Bool),
        any::<u8>().prop_map(Value::U8),
        any::<i16>().prop_map(Value::I16),
        any::<u32>().prop_map(Value::U32),
        any::<i64>().prop_map(Value::I64),
        (-1.0e9f64..1.0e9).prop_map(Value::F64),
        any::<char>().prop_map(Value::Char),
        ".{0,40}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(|b| Value::Bytes(Bytes::from(b))),
        any::<i32>().prop_map(Value::Enum),
        any::<u32>().prop_map(Value::ObjectRef),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(4, 64, 8, |inner| {
        prop::collection::vec(inner, 0..8).prop_map(Value::List)
    })
}

fn kind() -> impl Strategy<Value = PacketKind> {
    prop_oneof![
        Just(PacketKind::Readiness),
        Just(PacketKind::RpcCall),
        Just(PacketKind::RpcResult),
        Just(PacketKind::ObjectManagement),
        Just(PacketKind::SyncVarUpdate),
        Just(PacketKind::StreamData),
        Just(PacketKind::Custom),
    ]
}

// Property: every value survives the tagged encoding, and the standalone
// byte form agrees with it
proptest! {
    #[test]
    fn prop_value_roundtrip(v in value()) {
        let tagged = v.to_tagged().expect("encode");
        prop_assert_eq!(tagged.is_null(), v.is_void());
        prop_assert_eq!(&Value::from_tagged(&tagged).expect("decode"), &v);

        let bytes = tagged.to_bytes().expect("bytes");
        prop_assert_eq!(SerializedData::from_bytes(&bytes).expect("parse"), tagged);
    }
}

// Property: arbitrary bytes never panic the value decoder
proptest! {
    #[test]
    fn prop_value_decoder_total(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(tagged) = SerializedData::from_bytes(&data) {
            let _ = Value::from_tagged(&tagged);
        }
    }
}

// Property: a byte stream of frames decodes identically however it is split
proptest! {
    #[test]
    fn prop_frames_survive_any_split(
        bodies in prop::collection::vec((kind(), prop::collection::vec(any::<u8>(), 0..300)), 1..8),
        cut in 1usize..97,
    ) {
        let mut codec = FrameCodec::new(4096);
        let frames: Vec<Frame> = bodies
            .into_iter()
            .map(|(k, b)| Frame::new(k, PacketFlags::NONE, Bytes::from(b)).unwrap())
            .collect();
        let mut wire = BytesMut::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        let mut buffer = BytesMut::new();
        for chunk in wire.chunks(cut) {
            buffer.extend_from_slice(chunk);
            while let Some(frame) = codec.decode(&mut buffer).unwrap() {
                decoded.push(frame);
            }
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(decoded, frames);
    }
}

// Property: arbitrary bytes never panic the frame decoder
proptest! {
    #[test]
    fn prop_frame_decoder_total(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut codec = FrameCodec::new(1024);
        let mut buffer = BytesMut::from(&data[..]);
        while let Ok(Some(_)) = codec.decode(&mut buffer) {}
    }
}

// Property: sealed envelopes open to the same envelope, compressed or not
proptest! {
    #[test]
    fn prop_sealed_envelope_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        compressed in any::<bool>(),
        zstd in any::<bool>(),
    ) {
        let wire = WireFormat {
            compression_enabled: compressed,
            compression_kind: if zstd { CompressionKind::Zstd } else { CompressionKind::Lz4 },
            compression_threshold: 64,
            max_payload_size: 1 << 20,
        };
        let envelope = Envelope {
            meta: PacketMeta { destination: 3, source: 0, sent_at: 1_700_000_000_000 },
            message: Message::Custom(CustomPayload { id: 9, payload: Bytes::from(payload) }),
        };
        let frame = wire.seal(&envelope, PacketFlags::NONE, None).unwrap();
        prop_assert!(!frame.flags().is_encrypted());
        prop_assert_eq!(wire.open(&frame, None, false).unwrap(), envelope);
    }
}

// Property: LZ4 compression roundtrip preserves data
proptest! {
    #[test]
    fn prop_lz4_compression_roundtrip(data in prop::collection::vec(any::<u8>(), 0..50000)) {
        let compressed = compress(&data, CompressionKind::Lz4).expect("Compression should not fail");
        let decompressed = decompress(&compressed, CompressionKind::Lz4).expect("Decompression should not fail");

        prop_assert_eq!(decompressed, data);
    }
}

// Property: Zstd compression roundtrip preserves data
proptest! {
    #[test]
    fn prop_zstd_compression_roundtrip(data in prop::collection::vec(any::<u8>(), 0..50000)) {
        let compressed = compress(&data, CompressionKind::Zstd).expect("Compression should not fail");
        let decompressed = decompress(&compressed, CompressionKind::Zstd).expect("Decompression should not fail");

        prop_assert_eq!(decompressed, data);
    }
}
