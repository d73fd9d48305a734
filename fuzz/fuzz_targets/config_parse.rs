//! Fuzz target for node configuration parsing
//!
//! Arbitrary TOML must deserialize or fail cleanly, and validation must not
//! panic on whatever deserialized.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sdp_core::NodeConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<NodeConfig>(s) {
            let _ = config.validate();
        }
    }
});
