//! Fuzz target for dispatcher configuration parsing
//!
//! Arbitrary TOML must never panic deserialization or validation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_core::rpc::DispatcherConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        if let Ok(config) = toml::from_str::<DispatcherConfig>(s) {
            let _ = config.validate();
        }
    }
});
