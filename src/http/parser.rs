use super::chunked::ChunkedBody;
use super::host::Host;
use crate::security::Limits;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};

/// Ordered header pairs exactly as they appeared in a head
pub type HeaderList = Vec<(HeaderName, HeaderValue)>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Head too large: {size} bytes seen, maximum allowed: {max} bytes")]
    HeadersTooLarge { size: usize, max: usize },
    #[error("Too many headers, maximum allowed: {max}")]
    TooManyHeaders { max: usize },
    #[error("No Host header or absolute-URI authority")]
    MissingHost,
    #[error("Body too large: {size} bytes, maximum allowed: {max} bytes")]
    BodyTooLarge { size: u64, max: u64 },
    #[error("Transfer-Encoding on requests is not supported")]
    UnsupportedTransferCoding,
    #[error("Connection closed after {received} bytes of an unfinished head")]
    IncompleteHead { received: usize },
    #[error("Connection closed {missing} bytes short of the declared body")]
    IncompleteBody { missing: u64 },
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Parser misuse: {0}")]
    InvalidState(&'static str),
}

/// How many body bytes follow a head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Exactly this many bytes (`Content-Length`, or zero)
    Fixed(u64),
    /// `Transfer-Encoding` ending in `chunked`; ends with the last chunk
    Chunked,
    /// Delimited by the peer closing the connection
    UntilClose,
}

/// Body progress once a head has been parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyProgress {
    Remaining(u64),
    Chunked(ChunkedBody),
    UntilClose { received: u64 },
}

/// Per-direction parser state; transitions only move forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserState {
    AwaitingHeadLine,
    AwaitingHeaders,
    AwaitingBody(BodyProgress),
    Complete,
    Failed(ParseError),
}

/// Outcome of feeding bytes to a head parser
#[derive(Debug)]
pub enum Feed<H> {
    NeedMore,
    /// `consumed` counts the bytes of the last chunk that belonged to the
    /// head; anything after them is body.
    Head { head: H, consumed: usize },
}

/// Common view over request and response heads
pub trait MessageHead {
    /// The head bytes as received, terminating blank line included
    fn raw(&self) -> &Bytes;

    fn body_length(&self) -> BodyLength;

    fn head_len(&self) -> usize {
        self.raw().len()
    }
}

/// Which kind of start line a parser expects
pub trait HeadKind {
    type Head: MessageHead;

    /// Parses a complete head out of `buf`, or returns `None` when more bytes
    /// are needed
    fn parse(&self, buf: &[u8], limits: &Limits) -> Result<Option<Self::Head>, ParseError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderList,
    pub host: Host,
    pub body: BodyLength,
    pub raw: Bytes,
}

impl MessageHead for RequestHead {
    fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn body_length(&self) -> BodyLength {
        self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderList,
    pub body: BodyLength,
    pub raw: Bytes,
}

impl MessageHead for ResponseHead {
    fn raw(&self) -> &Bytes {
        &self.raw
    }

    fn body_length(&self) -> BodyLength {
        self.body
    }
}

/// Request heads: `METHOD target HTTP/1.x`
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestKind;

impl HeadKind for RequestKind {
    type Head = RequestHead;

    fn parse(&self, buf: &[u8], limits: &Limits) -> Result<Option<RequestHead>, ParseError> {
        let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut req = httparse::Request::new(&mut slots);
        let len = match req.parse(buf).map_err(|e| map_httparse_error(e, limits))? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };
        limits.check_head(len)?;

        let method = req
            .method
            .ok_or_else(|| ParseError::Malformed("missing method".to_string()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ParseError::Malformed(format!("invalid method: {e}")))?;
        let target = req
            .path
            .ok_or_else(|| ParseError::Malformed("missing request target".to_string()))?
            .to_string();
        let version = map_version(req.version)?;
        let headers = collect_headers(req.headers)?;

        let host = Host::resolve(&target, &headers)?;
        if headers.iter().any(|(name, _)| *name == TRANSFER_ENCODING) {
            return Err(ParseError::UnsupportedTransferCoding);
        }
        let body = BodyLength::Fixed(content_length(&headers)?.unwrap_or(0));

        Ok(Some(RequestHead {
            method,
            target,
            version,
            headers,
            host,
            body,
            raw: Bytes::copy_from_slice(&buf[..len]),
        }))
    }
}

/// Response heads: `HTTP/1.x code reason`
///
/// The body framing of a response depends on the request it answers, so the
/// kind remembers whether that request was a `HEAD`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseKind {
    head_request: bool,
}

impl ResponseKind {
    pub fn for_method(method: &Method) -> Self {
        Self {
            head_request: *method == Method::HEAD,
        }
    }
}

impl HeadKind for ResponseKind {
    type Head = ResponseHead;

    fn parse(&self, buf: &[u8], limits: &Limits) -> Result<Option<ResponseHead>, ParseError> {
        let mut slots = vec![httparse::EMPTY_HEADER; limits.max_headers];
        let mut res = httparse::Response::new(&mut slots);
        let len = match res.parse(buf).map_err(|e| map_httparse_error(e, limits))? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };
        limits.check_head(len)?;

        let version = map_version(res.version)?;
        let code = res
            .code
            .ok_or_else(|| ParseError::Malformed("missing status code".to_string()))?;
        let status = StatusCode::from_u16(code)
            .map_err(|e| ParseError::Malformed(format!("invalid status code: {e}")))?;
        let reason = res.reason.unwrap_or_default().to_string();
        let headers = collect_headers(res.headers)?;

        let bodiless = self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let body = if bodiless {
            BodyLength::Fixed(0)
        } else if let Some(chunked) = final_coding_is_chunked(&headers) {
            if chunked {
                BodyLength::Chunked
            } else {
                BodyLength::UntilClose
            }
        } else {
            match content_length(&headers)? {
                Some(n) => BodyLength::Fixed(n),
                None => BodyLength::UntilClose,
            }
        };

        Ok(Some(ResponseHead {
            version,
            status,
            reason,
            headers,
            body,
            raw: Bytes::copy_from_slice(&buf[..len]),
        }))
    }
}

/// Incremental head parser with body accounting
///
/// The parser never performs I/O: callers hand it whatever bytes arrived and
/// act on the returned [`Feed`]. It buffers at most
/// `max_header_bytes + 1` bytes of head.
#[derive(Debug)]
pub struct HeadParser<K: HeadKind> {
    kind: K,
    limits: Limits,
    buf: BytesMut,
    state: ParserState,
}

pub type RequestParser = HeadParser<RequestKind>;
pub type ResponseParser = HeadParser<ResponseKind>;

impl RequestParser {
    pub fn request(limits: Limits) -> Self {
        Self::new(RequestKind, limits)
    }
}

impl ResponseParser {
    pub fn response(kind: ResponseKind, limits: Limits) -> Self {
        Self::new(kind, limits)
    }
}

impl<K: HeadKind> HeadParser<K> {
    pub fn new(kind: K, limits: Limits) -> Self {
        Self {
            kind,
            limits,
            buf: BytesMut::new(),
            state: ParserState::AwaitingHeadLine,
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    /// Number of head bytes buffered so far
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds the next chunk of the byte stream
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Feed<K::Head>, ParseError> {
        match &self.state {
            ParserState::AwaitingHeadLine | ParserState::AwaitingHeaders => {}
            ParserState::Failed(err) => return Err(err.clone()),
            _ => return Err(ParseError::InvalidState("head already parsed")),
        }

        let before = self.buf.len();
        let room = self.limits.head_buffer_cap().saturating_sub(before);
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let head = match self.kind.parse(&self.buf, &self.limits) {
            Ok(Some(head)) => head,
            Ok(None) => {
                if self.buf.len() > self.limits.max_header_bytes {
                    let size = self.buf.len();
                    return self.fail(ParseError::HeadersTooLarge {
                        size,
                        max: self.limits.max_header_bytes,
                    });
                }
                if self.buf.contains(&b'\n') {
                    self.state = ParserState::AwaitingHeaders;
                }
                return Ok(Feed::NeedMore);
            }
            Err(err) => return self.fail(err),
        };

        let body = head.body_length();
        if let BodyLength::Fixed(n) = body {
            if let Err(err) = self.limits.check_body(n) {
                return self.fail(err);
            }
        }

        let consumed = head.head_len().saturating_sub(before);
        self.buf = BytesMut::new();
        self.state = match body {
            BodyLength::Fixed(0) => ParserState::Complete,
            BodyLength::Fixed(n) => ParserState::AwaitingBody(BodyProgress::Remaining(n)),
            BodyLength::Chunked => ParserState::AwaitingBody(BodyProgress::Chunked(ChunkedBody::new())),
            BodyLength::UntilClose => {
                ParserState::AwaitingBody(BodyProgress::UntilClose { received: 0 })
            }
        };

        Ok(Feed::Head { head, consumed })
    }

    /// Accounts for the `available` body bytes and returns how many of them
    /// belong to the current message
    pub fn consume_body(&mut self, available: &[u8]) -> Result<usize, ParseError> {
        match &self.state {
            ParserState::AwaitingBody(BodyProgress::Remaining(remaining)) => {
                let take = (*remaining).min(available.len() as u64);
                let left = *remaining - take;
                self.state = if left == 0 {
                    ParserState::Complete
                } else {
                    ParserState::AwaitingBody(BodyProgress::Remaining(left))
                };
                Ok(take as usize)
            }
            ParserState::AwaitingBody(BodyProgress::Chunked(chunked)) => {
                let mut chunked = *chunked;
                let take = match chunked.advance(available) {
                    Ok(take) => take,
                    Err(err) => return self.fail(err),
                };
                if let Err(err) = self.limits.check_body(chunked.received()) {
                    return self.fail(err);
                }
                self.state = if chunked.is_done() {
                    ParserState::Complete
                } else {
                    ParserState::AwaitingBody(BodyProgress::Chunked(chunked))
                };
                Ok(take)
            }
            ParserState::AwaitingBody(BodyProgress::UntilClose { received }) => {
                let received = received.saturating_add(available.len() as u64);
                if let Err(err) = self.limits.check_body(received) {
                    return self.fail(err);
                }
                self.state = ParserState::AwaitingBody(BodyProgress::UntilClose { received });
                Ok(available.len())
            }
            ParserState::Complete => Ok(0),
            ParserState::Failed(err) => Err(err.clone()),
            ParserState::AwaitingHeadLine | ParserState::AwaitingHeaders => {
                Err(ParseError::InvalidState("body before head"))
            }
        }
    }

    /// Signals that the peer closed its side of the stream
    pub fn finish(&mut self) -> Result<(), ParseError> {
        match &self.state {
            ParserState::Complete | ParserState::AwaitingBody(BodyProgress::UntilClose { .. }) => {
                self.state = ParserState::Complete;
                Ok(())
            }
            ParserState::AwaitingBody(BodyProgress::Remaining(missing)) => {
                let missing = *missing;
                self.fail(ParseError::IncompleteBody { missing })
            }
            ParserState::AwaitingBody(BodyProgress::Chunked(chunked)) => {
                let missing = chunked.pending_data();
                self.fail(ParseError::IncompleteBody { missing })
            }
            ParserState::AwaitingHeadLine | ParserState::AwaitingHeaders => {
                let received = self.buf.len();
                self.fail(ParseError::IncompleteHead { received })
            }
            ParserState::Failed(err) => Err(err.clone()),
        }
    }

    fn fail<T>(&mut self, err: ParseError) -> Result<T, ParseError> {
        self.buf = BytesMut::new();
        self.state = ParserState::Failed(err.clone());
        Err(err)
    }
}

fn map_httparse_error(err: httparse::Error, limits: &Limits) -> ParseError {
    match err {
        httparse::Error::TooManyHeaders => ParseError::TooManyHeaders {
            max: limits.max_headers,
        },
        other => ParseError::Malformed(other.to_string()),
    }
}

fn map_version(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        _ => Err(ParseError::Malformed("unsupported HTTP version".to_string())),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderList, ParseError> {
    raw.iter()
        .map(|header| {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| ParseError::Malformed(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| ParseError::Malformed(format!("invalid header value: {e}")))?;
            Ok((name, value))
        })
        .collect()
}

/// Declared `Content-Length`; repeated headers must agree
fn content_length(headers: &[(HeaderName, HeaderValue)]) -> Result<Option<u64>, ParseError> {
    let mut declared = None;
    for (_, value) in headers.iter().filter(|(name, _)| *name == CONTENT_LENGTH) {
        let text = value.to_str().map_err(|_| invalid_content_length())?.trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_content_length());
        }
        let n: u64 = text.parse().map_err(|_| invalid_content_length())?;
        match declared {
            Some(previous) if previous != n => {
                return Err(ParseError::Malformed(
                    "conflicting Content-Length headers".to_string(),
                ));
            }
            _ => declared = Some(n),
        }
    }
    Ok(declared)
}

/// `Some(true)` when the last transfer coding is `chunked`, `None` without
/// any `Transfer-Encoding`
fn final_coding_is_chunked(headers: &[(HeaderName, HeaderValue)]) -> Option<bool> {
    let (_, last) = headers
        .iter()
        .rev()
        .find(|(name, _)| *name == TRANSFER_ENCODING)?;
    let chunked = last
        .to_str()
        .ok()
        .and_then(|value| value.rsplit(',').next())
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    Some(chunked)
}

fn invalid_content_length() -> ParseError {
    ParseError::Malformed("invalid Content-Length".to_string())
}
