#![no_main]

use faultring_core::config::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = Config::from_toml_str(text) {
        // Anything accepted must survive a round trip and stay valid.
        let rendered = toml::to_string(&config).expect("serialize");
        let reparsed = Config::from_toml_str(&rendered).expect("reparse");
        assert_eq!(reparsed.ring, config.ring);
    }
});
