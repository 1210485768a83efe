use super::parser::{
    BodyLength, BodyProgress, Feed, ParseError, ParserState, RequestParser, ResponseKind,
    ResponseParser,
};
use super::{Host, MessageHead};
use crate::security::Limits;
use http::{Method, StatusCode, Version};

const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8000\r\nAccept: */*\r\n\r\n";

fn small_limits() -> Limits {
    Limits {
        max_header_bytes: 128,
        max_body_bytes: 64,
        max_headers: 8,
    }
}

/// Feeds `input` in pieces of `step` bytes and returns the head plus the
/// total number of bytes the parser claimed for it
fn feed_in_steps(parser: &mut RequestParser, input: &[u8], step: usize) -> Option<(super::RequestHead, usize)> {
    let mut offset = 0;
    for chunk in input.chunks(step) {
        match parser.feed(chunk).unwrap() {
            Feed::NeedMore => offset += chunk.len(),
            Feed::Head { head, consumed } => return Some((head, offset + consumed)),
        }
    }
    None
}

#[test]
fn test_simple_get_request() {
    let mut parser = RequestParser::request(Limits::default());

    let Feed::Head { head, consumed } = parser.feed(GET).unwrap() else {
        panic!("Expected a complete head");
    };

    assert_eq!(consumed, GET.len());
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "/");
    assert_eq!(head.version, Version::HTTP_11);
    assert_eq!(head.host, Host::new("127.0.0.1", 8000));
    assert_eq!(head.body, BodyLength::Fixed(0));
    assert_eq!(head.raw.as_ref(), GET);
    assert_eq!(head.headers.len(), 2);
    assert_eq!(head.headers[1].0, "accept");
    assert!(parser.is_complete());
}

#[test]
fn test_request_split_one_byte_at_a_time() {
    let mut parser = RequestParser::request(Limits::default());

    let (head, consumed) = feed_in_steps(&mut parser, GET, 1).expect("head should complete");

    assert_eq!(consumed, GET.len());
    assert_eq!(head.raw.as_ref(), GET);
    assert!(parser.is_complete());
}

#[test]
fn test_state_moves_from_head_line_to_headers() {
    let mut parser = RequestParser::request(Limits::default());

    assert!(matches!(parser.feed(b"GET / HT").unwrap(), Feed::NeedMore));
    assert_eq!(*parser.state(), ParserState::AwaitingHeadLine);

    assert!(matches!(parser.feed(b"TP/1.1\r\nHost: a").unwrap(), Feed::NeedMore));
    assert_eq!(*parser.state(), ParserState::AwaitingHeaders);

    assert!(matches!(parser.feed(b".example\r\n\r").unwrap(), Feed::NeedMore));
    assert!(matches!(parser.feed(b"\n").unwrap(), Feed::Head { consumed: 1, .. }));
    assert_eq!(*parser.state(), ParserState::Complete);
}

#[test]
fn test_post_body_prefix_in_same_chunk() {
    let request = b"POST /submit HTTP/1.1\r\nHost: localhost:8000\r\nContent-Length: 18\r\n\r\nTest POST payload.";
    let mut parser = RequestParser::request(Limits::default());

    let Feed::Head { head, consumed } = parser.feed(request).unwrap() else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.body, BodyLength::Fixed(18));
    assert_eq!(&request[consumed..], b"Test POST payload.");
    assert_eq!(
        *parser.state(),
        ParserState::AwaitingBody(BodyProgress::Remaining(18))
    );

    assert_eq!(parser.consume_body(&request[consumed..]).unwrap(), 18);
    assert!(parser.is_complete());
}

#[test]
fn test_body_accounting_stops_at_declared_length() {
    let request = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n";
    let mut parser = RequestParser::request(Limits::default());
    parser.feed(request).unwrap();

    assert_eq!(parser.consume_body(b"abc").unwrap(), 3);
    assert_eq!(parser.consume_body(b"deGET / HTT").unwrap(), 2);
    assert!(parser.is_complete());
    assert_eq!(parser.consume_body(b"P/1.1\r\n").unwrap(), 0);
}

#[test]
fn test_headers_too_large_before_terminator() {
    let limits = Limits::default();
    let mut request = b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8000\r\nX-Long-Header: ".to_vec();
    request.extend(std::iter::repeat_n(b'a', 8192));
    request.extend_from_slice(b"\r\n\r\n");

    let mut parser = RequestParser::request(limits);
    let err = parser.feed(&request).unwrap_err();

    assert!(matches!(err, ParseError::HeadersTooLarge { max: 8192, .. }));
    assert_eq!(*parser.state(), ParserState::Failed(err.clone()));
    assert_eq!(parser.buffered(), 0);
    // terminal: more input does not revive the parser
    assert_eq!(parser.feed(b"\r\n\r\n").unwrap_err(), err);
}

#[test]
fn test_headers_too_large_when_fragmented() {
    let limits = small_limits();
    let mut parser = RequestParser::request(limits);

    assert!(matches!(parser.feed(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap(), Feed::NeedMore));
    let filler = [b'x'; 16];
    let mut result = Ok(Feed::NeedMore);
    for _ in 0..10 {
        result = parser.feed(&filler);
        if result.is_err() {
            break;
        }
    }

    assert!(matches!(result, Err(ParseError::HeadersTooLarge { max: 128, .. })));
    assert!(parser.buffered() == 0);
}

#[test]
fn test_head_exactly_at_limit_is_accepted() {
    let prefix = b"GET / HTTP/1.1\r\nHost: a\r\nX-Pad: ";
    let suffix = b"\r\n\r\n";
    let limits = small_limits();
    let pad = limits.max_header_bytes - prefix.len() - suffix.len();

    let mut request = prefix.to_vec();
    request.extend(std::iter::repeat_n(b'p', pad));
    request.extend_from_slice(suffix);
    assert_eq!(request.len(), limits.max_header_bytes);

    let mut parser = RequestParser::request(limits);
    assert!(matches!(parser.feed(&request).unwrap(), Feed::Head { .. }));

    request.insert(prefix.len(), b'p');
    let mut parser = RequestParser::request(limits);
    assert!(matches!(
        parser.feed(&request),
        Err(ParseError::HeadersTooLarge { .. })
    ));
}

#[test]
fn test_body_bytes_do_not_count_towards_head_limit() {
    let limits = Limits {
        max_header_bytes: 64,
        ..small_limits()
    };
    let mut request = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 60\r\n\r\n".to_vec();
    let head_len = request.len();
    request.extend(std::iter::repeat_n(b'b', 60));
    assert!(request.len() > limits.max_header_bytes);

    let mut parser = RequestParser::request(limits);
    let Feed::Head { consumed, .. } = parser.feed(&request).unwrap() else {
        panic!("Expected a complete head");
    };
    assert_eq!(consumed, head_len);
    assert_eq!(parser.consume_body(&request[consumed..]).unwrap(), 60);
}

#[test]
fn test_missing_host_is_rejected() {
    let mut parser = RequestParser::request(Limits::default());
    assert_eq!(
        parser.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap_err(),
        ParseError::MissingHost
    );
    assert!(matches!(parser.state(), ParserState::Failed(ParseError::MissingHost)));
}

#[test]
fn test_absolute_uri_without_host_header() {
    let mut parser = RequestParser::request(Limits::default());
    let Feed::Head { head, .. } = parser
        .feed(b"GET http://127.0.0.1:9999/ HTTP/1.1\r\n\r\n")
        .unwrap()
    else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.host, Host::new("127.0.0.1", 9999));
    assert_eq!(head.target, "http://127.0.0.1:9999/");
}

#[test]
fn test_request_body_too_large() {
    let mut parser = RequestParser::request(small_limits());
    assert_eq!(
        parser
            .feed(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 65\r\n\r\n")
            .unwrap_err(),
        ParseError::BodyTooLarge { size: 65, max: 64 }
    );
}

#[test]
fn test_chunked_request_is_rejected() {
    let mut parser = RequestParser::request(Limits::default());
    assert_eq!(
        parser
            .feed(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap_err(),
        ParseError::UnsupportedTransferCoding
    );
}

#[test]
fn test_invalid_content_length() {
    for value in ["abc", "-1", "+5", "", "5, 6"] {
        let request = format!("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: {value}\r\n\r\n");
        let mut parser = RequestParser::request(Limits::default());
        assert!(
            matches!(parser.feed(request.as_bytes()), Err(ParseError::Malformed(_))),
            "Content-Length {value:?} should be rejected"
        );
    }
}

#[test]
fn test_conflicting_content_lengths() {
    let mut parser = RequestParser::request(Limits::default());
    let result = parser.feed(
        b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n",
    );
    assert!(matches!(result, Err(ParseError::Malformed(_))));
}

#[test]
fn test_too_many_headers() {
    let mut request = b"GET / HTTP/1.1\r\nHost: a\r\n".to_vec();
    for i in 0..8 {
        request.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
    }
    request.extend_from_slice(b"\r\n");

    let mut parser = RequestParser::request(Limits {
        max_header_bytes: 8192,
        ..small_limits()
    });
    assert_eq!(
        parser.feed(&request).unwrap_err(),
        ParseError::TooManyHeaders { max: 8 }
    );
}

#[test]
fn test_malformed_request_line() {
    let mut parser = RequestParser::request(Limits::default());
    assert!(matches!(
        parser.feed(b"GET /\x01 HTTP/1.1\r\nHost: a\r\n\r\n"),
        Err(ParseError::Malformed(_))
    ));
}

#[test]
fn test_body_before_head_is_misuse() {
    let mut parser = RequestParser::request(Limits::default());
    assert!(matches!(
        parser.consume_body(b"body"),
        Err(ParseError::InvalidState(_))
    ));
}

#[test]
fn test_feed_after_head_is_misuse() {
    let mut parser = RequestParser::request(Limits::default());
    parser.feed(GET).unwrap();
    assert!(matches!(parser.feed(GET), Err(ParseError::InvalidState(_))));
}

#[test]
fn test_eof_inside_head() {
    let mut parser = RequestParser::request(Limits::default());
    parser.feed(b"GET / HTTP/1.1\r\nHo").unwrap();
    assert_eq!(
        parser.finish().unwrap_err(),
        ParseError::IncompleteHead { received: 18 }
    );
}

#[test]
fn test_response_with_content_length() {
    let response = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK";
    let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());

    let Feed::Head { head, consumed } = parser.feed(response).unwrap() else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.reason, "OK");
    assert_eq!(head.version, Version::HTTP_10);
    assert_eq!(head.body_length(), BodyLength::Fixed(2));
    assert_eq!(head.raw.len(), consumed);
    assert_eq!(&response[consumed..], b"OK");

    assert_eq!(parser.consume_body(b"OK").unwrap(), 2);
    assert!(parser.is_complete());
}

#[test]
fn test_response_body_too_large_is_detected_at_head() {
    let limits = Limits::default();
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
        limits.max_body_bytes + 1
    );
    let mut parser = ResponseParser::response(ResponseKind::default(), limits);

    assert_eq!(
        parser.feed(response.as_bytes()).unwrap_err(),
        ParseError::BodyTooLarge {
            size: limits.max_body_bytes + 1,
            max: limits.max_body_bytes
        }
    );
}

#[test]
fn test_response_to_head_request_has_no_body() {
    let mut parser = ResponseParser::response(
        ResponseKind::for_method(&Method::HEAD),
        small_limits(),
    );
    let Feed::Head { head, .. } = parser
        .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 999999\r\n\r\n")
        .unwrap()
    else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.body, BodyLength::Fixed(0));
    assert!(parser.is_complete());
}

#[test]
fn test_bodiless_statuses() {
    for status in ["204 No Content", "304 Not Modified", "100 Continue"] {
        let response = format!("HTTP/1.1 {status}\r\n\r\n");
        let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());
        let Feed::Head { head, .. } = parser.feed(response.as_bytes()).unwrap() else {
            panic!("Expected a complete head for {status}");
        };
        assert_eq!(head.body, BodyLength::Fixed(0), "{status}");
    }
}

#[test]
fn test_response_without_length_reads_until_close() {
    let mut parser = ResponseParser::response(ResponseKind::default(), small_limits());
    let Feed::Head { head, .. } = parser.feed(b"HTTP/1.0 200 OK\r\n\r\n").unwrap() else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.body, BodyLength::UntilClose);

    assert_eq!(parser.consume_body(&[b'x'; 40]).unwrap(), 40);
    assert_eq!(parser.consume_body(&[b'y'; 24]).unwrap(), 24);
    parser.finish().unwrap();
    assert!(parser.is_complete());
}

#[test]
fn test_streamed_body_over_limit_fails() {
    let mut parser = ResponseParser::response(ResponseKind::default(), small_limits());
    parser
        .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\n")
        .unwrap();

    assert_eq!(parser.consume_body(&[0; 64]).unwrap(), 64);
    assert_eq!(
        parser.consume_body(&[0]).unwrap_err(),
        ParseError::BodyTooLarge { size: 65, max: 64 }
    );
}

#[test]
fn test_short_fixed_body_on_eof() {
    let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());
    parser
        .feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n")
        .unwrap();
    parser.consume_body(b"0123").unwrap();

    assert_eq!(
        parser.finish().unwrap_err(),
        ParseError::IncompleteBody { missing: 6 }
    );
}

#[test]
fn test_chunked_response_ends_at_last_chunk() {
    let body = b"2\r\nOK\r\n0\r\n\r\n";
    let mut response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    response.extend_from_slice(body);
    let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());

    let Feed::Head { head, consumed } = parser.feed(&response).unwrap() else {
        panic!("Expected a complete head");
    };
    assert_eq!(head.body, BodyLength::Chunked);
    assert!(matches!(
        parser.state(),
        ParserState::AwaitingBody(BodyProgress::Chunked(_))
    ));

    assert_eq!(parser.consume_body(&response[consumed..consumed + 5]).unwrap(), 5);
    assert!(!parser.is_complete());
    assert_eq!(parser.consume_body(&response[consumed + 5..]).unwrap(), body.len() - 5);
    assert!(parser.is_complete());
}

#[test]
fn test_chunked_must_be_the_final_coding() {
    for (coding, expected) in [
        ("gzip, chunked", BodyLength::Chunked),
        ("Chunked", BodyLength::Chunked),
        ("chunked, gzip", BodyLength::UntilClose),
        ("identity", BodyLength::UntilClose),
    ] {
        let response = format!("HTTP/1.1 200 OK\r\nTransfer-Encoding: {coding}\r\n\r\n");
        let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());
        let Feed::Head { head, .. } = parser.feed(response.as_bytes()).unwrap() else {
            panic!("Expected a complete head for {coding}");
        };
        assert_eq!(head.body, expected, "{coding}");
    }
}

#[test]
fn test_chunked_response_cut_short() {
    let mut parser = ResponseParser::response(ResponseKind::default(), Limits::default());
    parser
        .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();
    parser.consume_body(b"a\r\n0123").unwrap();

    assert_eq!(
        parser.finish().unwrap_err(),
        ParseError::IncompleteBody { missing: 6 }
    );
}

#[test]
fn test_chunked_framing_counts_towards_body_limit() {
    let mut parser = ResponseParser::response(ResponseKind::default(), small_limits());
    parser
        .feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();

    assert_eq!(parser.consume_body(b"40\r\n").unwrap(), 4);
    assert_eq!(
        parser.consume_body(&[b'x'; 64]).unwrap_err(),
        ParseError::BodyTooLarge { size: 68, max: 64 }
    );
}

#[test]
fn test_response_headers_too_large() {
    let mut response = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
    response.extend(std::iter::repeat_n(b'z', 200));
    response.extend_from_slice(b"\r\n\r\n");

    let mut parser = ResponseParser::response(ResponseKind::default(), small_limits());
    assert!(matches!(
        parser.feed(&response),
        Err(ParseError::HeadersTooLarge { max: 128, .. })
    ));
}
