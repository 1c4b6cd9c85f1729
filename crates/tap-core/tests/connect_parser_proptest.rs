use proptest::prelude::*;
use tap_core::{
    parse_connect_request_line, parse_connect_target, ConnectParseError, ConnectParseMode,
};

fn host_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9](?:[a-z0-9.-]{0,30}[a-z0-9])?")
        .expect("valid hostname regex")
}

proptest! {
    #[test]
    fn strict_parser_accepts_canonical_connect_lines(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("CONNECT {host}:{port} HTTP/1.1");
        let parsed = parse_connect_request_line(&line, ConnectParseMode::Strict)
            .expect("strict parser should accept canonical CONNECT line");
        prop_assert_eq!(parsed.authority(), format!("{host}:{port}"));
        prop_assert_eq!(parsed.host, host);
        prop_assert_eq!(parsed.port, port);
    }

    #[test]
    fn strict_parser_rejects_lowercase_method(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("connect {host}:{port} HTTP/1.1");
        let error = parse_connect_request_line(&line, ConnectParseMode::Strict)
            .expect_err("strict parser must reject lowercase method");
        prop_assert_eq!(error, ConnectParseError::MethodNotConnect);
    }

    #[test]
    fn lenient_parser_accepts_absolute_form_with_default_port(host in host_strategy()) {
        let target = format!("https://{host}/chat");
        let parsed = parse_connect_target(&target, ConnectParseMode::Lenient)
            .expect("lenient parser should normalize absolute-form authority");
        prop_assert_eq!(parsed.host, host);
        prop_assert_eq!(parsed.port, 443);
    }

    #[test]
    fn parser_never_panics_on_arbitrary_targets(target in "\\PC{0,64}") {
        let _ = parse_connect_target(&target, ConnectParseMode::Strict);
        let _ = parse_connect_target(&target, ConnectParseMode::Lenient);
    }
}
