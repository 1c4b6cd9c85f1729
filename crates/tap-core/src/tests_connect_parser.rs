use super::{
    parse_connect_request_line, parse_connect_target, ConnectParseError, ConnectParseMode,
    ConnectTarget,
};

#[test]
fn parses_connect_request_line_with_domain_authority() {
    let parsed = parse_connect_request_line(
        "CONNECT api.example.com:443 HTTP/1.1",
        ConnectParseMode::Strict,
    )
    .expect("must parse");
    assert_eq!(parsed.host, "api.example.com");
    assert_eq!(parsed.port, 443);
    assert_eq!(parsed.authority(), "api.example.com:443");
}

#[test]
fn parses_connect_target_with_ipv6_authority() {
    let parsed =
        parse_connect_target("[2001:db8::1]:8443", ConnectParseMode::Strict).expect("must parse");
    assert_eq!(
        parsed,
        ConnectTarget {
            host: "2001:db8::1".to_string(),
            port: 8443,
        }
    );
    assert_eq!(parsed.to_string(), "[2001:db8::1]:8443");
}

#[test]
fn rejects_non_connect_method() {
    let error = parse_connect_request_line("GET / HTTP/1.1", ConnectParseMode::Strict)
        .expect_err("must fail");
    assert_eq!(error, ConnectParseError::MethodNotConnect);
    assert_eq!(error.code(), "method_not_connect");
}

#[test]
fn rejects_unbracketed_ipv6_authority() {
    let error = parse_connect_target("2001:db8::1:443", ConnectParseMode::Strict)
        .expect_err("must fail");
    assert_eq!(error, ConnectParseError::InvalidAuthority);
}

#[test]
fn strict_mode_requires_port() {
    assert_eq!(
        parse_connect_target("example.com", ConnectParseMode::Strict),
        Err(ConnectParseError::MissingPort)
    );
    assert_eq!(
        parse_connect_target("example.com:", ConnectParseMode::Strict),
        Err(ConnectParseError::MissingPort)
    );
    assert_eq!(
        parse_connect_target("example.com:99999", ConnectParseMode::Strict),
        Err(ConnectParseError::InvalidPort)
    );
    assert_eq!(
        parse_connect_target(":443", ConnectParseMode::Strict),
        Err(ConnectParseError::InvalidAuthority)
    );
}

#[test]
fn lenient_mode_accepts_lowercase_method_and_missing_port() {
    let parsed = parse_connect_request_line(
        "connect api.example.com HTTP/1.1",
        ConnectParseMode::Lenient,
    )
    .expect("must parse in lenient mode");
    assert_eq!(parsed.host, "api.example.com");
    assert_eq!(parsed.port, 443);
}

#[test]
fn lenient_mode_accepts_absolute_form_authority() {
    let parsed = parse_connect_target(
        "https://api.example.com:8443/path",
        ConnectParseMode::Lenient,
    )
    .expect("must parse in lenient mode");
    assert_eq!(parsed.host, "api.example.com");
    assert_eq!(parsed.port, 8443);
}

#[test]
fn lenient_mode_accepts_bare_ipv6_literal() {
    let parsed =
        parse_connect_target("2001:db8::1", ConnectParseMode::Lenient).expect("bare v6 literal");
    assert_eq!(parsed.host, "2001:db8::1");
    assert_eq!(parsed.port, 443);
}

#[test]
fn strict_mode_rejects_lowercase_connect_method() {
    let error = parse_connect_request_line(
        "connect api.example.com:443 HTTP/1.1",
        ConnectParseMode::Strict,
    )
    .expect_err("strict mode must reject lowercase method");
    assert_eq!(error, ConnectParseError::MethodNotConnect);
}
