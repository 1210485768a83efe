//! HTTP/1.x message heads
//!
//! This module provides an incremental, I/O-free parser for request and
//! response heads, the body accounting that follows a head, and resolution of
//! the origin a request is addressed to.

pub mod chunked;
pub mod host;
pub mod parser;

#[cfg(test)]
mod tests;

pub use chunked::ChunkedBody;
pub use host::Host;
pub use parser::{
    BodyLength, BodyProgress, Feed, HeadKind, HeadParser, HeaderList, MessageHead, ParseError,
    ParserState, RequestHead, RequestKind, RequestParser, ResponseHead, ResponseKind,
    ResponseParser,
};
