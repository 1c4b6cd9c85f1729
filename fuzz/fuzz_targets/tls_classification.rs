#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_tls::classify_tls_error;

fuzz_target!(|data: &[u8]| {
    let message = String::from_utf8_lossy(data);
    let _ = classify_tls_error(&message).code();
    let _ = classify_tls_error(&message.to_ascii_uppercase()).code();
});
