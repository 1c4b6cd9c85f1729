#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_http::parse_chunk_len;

fuzz_target!(|data: &[u8]| {
    let _ = parse_chunk_len(data);
});
