#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_http::SseParser;

fuzz_target!(|data: &[u8]| {
    let mut parser = SseParser::with_max_event_bytes(4096);
    let split = data.first().map_or(1, |byte| usize::from(*byte % 16) + 1);
    for chunk in data.chunks(split) {
        if parser.feed(chunk).is_err() {
            parser.reset();
        }
    }
    let _ = parser.finish();
});
