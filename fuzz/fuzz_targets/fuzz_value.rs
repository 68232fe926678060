#![no_main]

use libfuzzer_sys::fuzz_target;
use synclink::core::serialization::{NoResolver, ValueCodec};
use synclink::core::value::SerializedData;

fuzz_target!(|data: &[u8]| {
    let Ok(tagged) = SerializedData::from_bytes(data) else {
        return;
    };
    let codec = ValueCodec::default();
    if let Ok(value) = codec.deserialize(&tagged, &NoResolver) {
        // Whatever decodes must encode again
        let again = codec.serialize(&value).expect("decoded value re-encodes");
        assert_eq!(again.tag(), tagged.tag());
    }
});
