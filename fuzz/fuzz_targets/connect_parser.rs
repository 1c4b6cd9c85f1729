#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_core::{parse_connect_request_line, parse_connect_target, ConnectParseMode};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    for mode in [ConnectParseMode::Strict, ConnectParseMode::Lenient] {
        for line in text.lines().take(8) {
            let _ = parse_connect_request_line(line, mode);
        }
        if let Ok(target) = parse_connect_target(text, mode) {
            assert!(!target.host.is_empty());
            let _ = target.authority();
        }
    }
});
