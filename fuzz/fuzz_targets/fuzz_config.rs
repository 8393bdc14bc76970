//! Fuzz target for configuration parsing.
//!
//! Arbitrary YAML and auth strings must never panic the parser or the
//! validator.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_mirror::{Credentials, SyncConfig};

fuzz_target!(|data: (&str, &str)| {
    let (yaml, auth) = data;

    if let Ok(config) = SyncConfig::from_yaml_str(yaml) {
        if config.validate().is_ok() {
            let _ = config.tick_interval();
            let _ = config.is_one_off();
        }
    }

    let _ = Credentials::decode(auth);
});
