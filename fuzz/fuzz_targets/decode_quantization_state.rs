#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(state) = knn_core::QuantizationState::from_bytes(data) {
        assert_eq!(state.to_bytes().len(), state.serialized_len());
    }
});
