#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use synclink::core::codec::FrameCodec;
use synclink::protocol::message::Envelope;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Split frames out of arbitrary bytes, then decode each body as a message
    let mut codec = FrameCodec::new(64 * 1024);
    let mut buffer = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buffer) {
        let _ = Envelope::decode(frame.kind(), &frame.body);
    }
});
