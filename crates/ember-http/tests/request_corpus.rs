use ember_http::{parse_request, HttpMethod, HttpParseError};

#[test]
fn well_formed_corpus_parses_to_expected_shapes() {
    let fixtures: [(&str, &[u8], HttpMethod, &str, &[u8]); 6] = [
        (
            "bare_get",
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
            HttpMethod::Get,
            "/",
            b"",
        ),
        (
            "get_with_query",
            b"GET /search?q=rust&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n",
            HttpMethod::Get,
            "/search",
            b"",
        ),
        (
            "post_with_content_length",
            b"POST /api/data HTTP/1.1\r\nHost: x\r\nContent-Length: 9\r\n\r\nname=test",
            HttpMethod::Post,
            "/api/data",
            b"name=test",
        ),
        (
            "chunked_post",
            b"POST /api/data HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ntest\r\n0\r\n\r\n",
            HttpMethod::Post,
            "/api/data",
            b"test",
        ),
        (
            "delete_without_body",
            b"DELETE /items/42 HTTP/1.1\r\nHost: x\r\n\r\n",
            HttpMethod::Delete,
            "/items/42",
            b"",
        ),
        (
            "http10_request",
            b"GET /legacy HTTP/1.0\r\nHost: x\r\n\r\n",
            HttpMethod::Get,
            "/legacy",
            b"",
        ),
    ];

    for (name, raw, method, path, body) in fixtures {
        let parsed = match parse_request(raw) {
            Ok(parsed) => parsed,
            Err(error) => panic!("{name} should parse, got {}", error.code()),
        };
        assert_eq!(parsed.request.method, method, "{name} method");
        assert_eq!(parsed.request.path, path, "{name} path");
        assert_eq!(parsed.request.body.as_ref(), body, "{name} body");
        assert!(parsed.request.valid, "{name} must be valid");
        assert_eq!(parsed.consumed, raw.len(), "{name} consumed");
    }
}

#[test]
fn malformed_corpus_reports_the_expected_error_kind() {
    let fixtures: [(&str, &[u8], HttpParseError); 7] = [
        (
            "missing_terminator",
            b"GET / HTTP/1.1\r\nHost: x\r\n",
            HttpParseError::NeedMore,
        ),
        (
            "request_line_too_many_fields",
            b"GET / extra HTTP/1.1\r\n\r\n",
            HttpParseError::Malformed,
        ),
        (
            "request_line_too_few_fields",
            b"GET /\r\n\r\n",
            HttpParseError::Malformed,
        ),
        (
            "http2_version",
            b"GET / HTTP/2.0\r\n\r\n",
            HttpParseError::InvalidVersion,
        ),
        (
            "garbage_version",
            b"GET / HTTPS/1.1\r\n\r\n",
            HttpParseError::InvalidVersion,
        ),
        (
            "chunk_size_not_hex",
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nqq\r\ndata\r\n0\r\n\r\n",
            HttpParseError::Malformed,
        ),
        (
            "declared_body_over_cap",
            b"POST /u HTTP/1.1\r\nContent-Length: 10485761\r\n\r\n",
            HttpParseError::TooLarge,
        ),
    ];

    for (name, raw, expected) in fixtures {
        let error = match parse_request(raw) {
            Ok(_) => panic!("{name} should fail to parse"),
            Err(error) => error,
        };
        assert_eq!(error, expected, "{name}");
    }
}

#[test]
fn header_validation_corpus_drops_only_the_offending_lines() {
    let fixtures: [(&str, &[u8], &str, bool); 5] = [
        (
            "space_in_name",
            b"GET / HTTP/1.1\r\nBad Name: v\r\nGood: 1\r\n\r\n",
            "bad name",
            false,
        ),
        (
            "control_char_in_value",
            b"GET / HTTP/1.1\r\nCtl: a\x02b\r\nGood: 1\r\n\r\n",
            "ctl",
            false,
        ),
        (
            "tab_in_value_is_allowed",
            b"GET / HTTP/1.1\r\nTabbed: a\tb\r\n\r\n",
            "tabbed",
            true,
        ),
        (
            "obs_text_is_allowed",
            b"GET / HTTP/1.1\r\nLatin: caf\xC3\xA9\r\n\r\n",
            "latin",
            true,
        ),
        (
            "empty_name",
            b"GET / HTTP/1.1\r\n: orphan\r\nGood: 1\r\n\r\n",
            "",
            false,
        ),
    ];

    for (name, raw, header, kept) in fixtures {
        let request = parse_request(raw)
            .unwrap_or_else(|error| panic!("{name} should parse, got {}", error.code()))
            .request;
        assert!(request.valid, "{name} stays valid");
        assert_eq!(request.has_header(header), kept, "{name}");
    }
}

#[test]
fn pipelined_requests_consume_exactly_one_message_each() {
    let raw: &[u8] = b"POST /one HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /two HTTP/1.1\r\n\r\n";
    let first = parse_request(raw).expect("first request parses");
    assert_eq!(first.request.path, "/one");
    assert_eq!(first.request.body.as_ref(), b"abc");

    let rest = &raw[first.consumed..];
    let second = parse_request(rest).expect("second request parses");
    assert_eq!(second.request.path, "/two");
    assert_eq!(second.request.method, HttpMethod::Get);
    assert_eq!(second.consumed, rest.len());
}
