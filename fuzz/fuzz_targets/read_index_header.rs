#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = knn_native::IndexHeader::from_bytes(data) {
        let _ = header.encoded_len();
        let _ = knn_native::IndexData::decode(data);
    }
});
