#![no_main]

use libfuzzer_sys::fuzz_target;
use synclink::utils::compression::{compress, decompress, CompressionKind};

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, kind) {
            let restored = decompress(&compressed, kind).expect("own output decompresses");
            assert_eq!(restored, data);
        }
        // Malformed input must fail cleanly and respect size limits
        let _ = decompress(data, kind);
    }
});
