#![no_main]

use libfuzzer_sys::fuzz_target;
use tap_http::{parse_request_head, parse_response_head};

fuzz_target!(|data: &[u8]| {
    let split = data
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(data.len());
    let request = &data[..split];
    let response = if split < data.len() {
        &data[split + 1..]
    } else {
        data
    };

    let method = match parse_request_head(request) {
        Ok(head) => head.method,
        Err(error) => {
            let _ = error.code();
            "GET".to_string()
        }
    };
    let _ = parse_response_head(response, &method);
});
