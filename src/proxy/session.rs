use super::connector::{ConnectError, OriginConnector};
use crate::config::SessionConfig;
use crate::http::{Feed, Host, ParseError, RequestParser, ResponseKind, ResponseParser};
use bytes::BytesMut;
use http::StatusCode;
use std::fmt;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Response sent when the origin cannot be reached
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
Content-Type: text/plain\r\n\
Content-Length: 13\r\n\
Connection: close\r\n\
\r\n\
Bad Gateway\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Client,
    Origin,
}

impl Peer {
    fn io_error(self, err: io::Error) -> SessionError {
        match self {
            Peer::Client => SessionError::Client(err),
            Peer::Origin => SessionError::Origin(err),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => f.write_str("client"),
            Peer::Origin => f.write_str("origin"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Rejected request: {0}")]
    Request(#[source] ParseError),
    #[error("Rejected response: {0}")]
    Response(#[source] ParseError),
    #[error("Origin unreachable: {0}")]
    OriginUnreachable(#[from] ConnectError),
    #[error("Origin closed the connection before sending a response head")]
    OriginClosed,
    #[error("Client I/O error: {0}")]
    Client(#[source] io::Error),
    #[error("Origin I/O error: {0}")]
    Origin(#[source] io::Error),
    #[error("Timed out waiting for the {0}")]
    Timeout(Peer),
}

/// What the client gets to see when a session fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Close without writing anything
    SilentClose,
    /// Answer with [`BAD_GATEWAY`], then close
    BadGateway,
}

impl SessionError {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            SessionError::Request(_)
            | SessionError::Client(_)
            | SessionError::Timeout(Peer::Client) => FailurePolicy::SilentClose,
            SessionError::Response(
                ParseError::HeadersTooLarge { .. }
                | ParseError::TooManyHeaders { .. }
                | ParseError::BodyTooLarge { .. },
            ) => FailurePolicy::SilentClose,
            SessionError::Response(_)
            | SessionError::OriginUnreachable(_)
            | SessionError::OriginClosed
            | SessionError::Origin(_)
            | SessionError::Timeout(Peer::Origin) => FailurePolicy::BadGateway,
        }
    }
}

#[derive(Debug)]
pub enum SessionState {
    ReadingRequestHead,
    Connecting(Host),
    RelayingRequestBody,
    RelayingResponseHead,
    RelayingResponseBody,
    Done,
    Failed(SessionError),
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// One full response reached the client
    Completed,
    /// A peer hung up; not an error
    Closed(Peer),
    Failed {
        error: SessionError,
        /// Whether a 502 was written before closing
        responded: bool,
    },
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Completed => f.write_str("completed"),
            SessionOutcome::Closed(peer) => write!(f, "closed by {peer}"),
            SessionOutcome::Failed { error, responded: true } => write!(f, "failed with 502: {error}"),
            SessionOutcome::Failed { error, responded: false } => write!(f, "failed: {error}"),
        }
    }
}

/// Summary produced when a session ends
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub peer: SocketAddr,
    /// Thread that drove the session
    pub thread: ThreadId,
    pub outcome: SessionOutcome,
    pub bytes_to_origin: u64,
    pub bytes_to_client: u64,
    pub elapsed: Duration,
}

/// The client socket and, once connected, its origin socket
///
/// Both are released together by [`SocketPair::close`].
#[derive(Debug)]
struct SocketPair {
    client: TcpStream,
    origin: Option<TcpStream>,
}

impl SocketPair {
    async fn close(self) {
        let SocketPair { mut client, origin } = self;
        if let Err(e) = client.shutdown().await {
            trace!(error = %e, "Client socket already gone");
        }
        if let Some(mut origin) = origin {
            if let Err(e) = origin.shutdown().await {
                trace!(error = %e, "Origin socket already gone");
            }
        }
    }
}

fn not_connected() -> SessionError {
    SessionError::Origin(io::Error::from(io::ErrorKind::NotConnected))
}

/// One client request/response cycle
pub struct Session {
    id: u64,
    peer: SocketAddr,
    config: SessionConfig,
    connector: OriginConnector,
    sockets: SocketPair,
    buffer: Vec<u8>,
    /// Head and body prefix waiting to be written to the origin
    upstream: BytesMut,
    request: RequestParser,
    response: ResponseParser,
    /// Framing rules for every response head, interim ones included
    response_kind: ResponseKind,
    state: SessionState,
    closed_by: Option<Peer>,
    bytes_to_origin: u64,
    bytes_to_client: u64,
}

impl Session {
    pub fn new(
        id: u64,
        client: TcpStream,
        peer: SocketAddr,
        config: SessionConfig,
        connector: OriginConnector,
    ) -> Self {
        Self {
            id,
            peer,
            config,
            connector,
            sockets: SocketPair {
                client,
                origin: None,
            },
            buffer: vec![0; config.buffer_size],
            upstream: BytesMut::new(),
            request: RequestParser::request(config.limits),
            response: ResponseParser::response(ResponseKind::default(), config.limits),
            response_kind: ResponseKind::default(),
            state: SessionState::ReadingRequestHead,
            closed_by: None,
            bytes_to_origin: 0,
            bytes_to_client: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drives the session to completion and closes both sockets
    pub async fn run(mut self) -> SessionReport {
        let thread = thread::current().id();
        let started = Instant::now();
        info!("New session started with ThreadID = {:?}", thread);

        let outcome = self.drive().await;
        match &outcome {
            SessionOutcome::Completed => info!("Session completed successfully"),
            SessionOutcome::Closed(peer) => debug!(%peer, "Session closed by peer"),
            SessionOutcome::Failed { error, responded } => {
                warn!(error = %error, responded = *responded, "Session error")
            }
        }

        let Session {
            id,
            peer,
            sockets,
            bytes_to_origin,
            bytes_to_client,
            ..
        } = self;
        sockets.close().await;

        SessionReport {
            id,
            peer,
            thread,
            outcome,
            bytes_to_origin,
            bytes_to_client,
            elapsed: started.elapsed(),
        }
    }

    async fn drive(&mut self) -> SessionOutcome {
        loop {
            let next = match mem::replace(&mut self.state, SessionState::Done) {
                SessionState::ReadingRequestHead => self.read_request_head().await,
                SessionState::Connecting(host) => self.connect(host).await,
                SessionState::RelayingRequestBody => self.relay_request_body().await,
                SessionState::RelayingResponseHead => self.read_response_head().await,
                SessionState::RelayingResponseBody => self.relay_response_body().await,
                SessionState::Done => {
                    return match self.closed_by {
                        Some(peer) => SessionOutcome::Closed(peer),
                        None => SessionOutcome::Completed,
                    };
                }
                SessionState::Failed(error) => {
                    let responded = self.respond_to_failure(&error).await;
                    return SessionOutcome::Failed { error, responded };
                }
            };
            self.state = next.unwrap_or_else(SessionState::Failed);
            trace!(state = ?self.state, "Session state changed");
        }
    }

    async fn read_request_head(&mut self) -> Result<SessionState, SessionError> {
        let n = read_from(
            &mut self.sockets.client,
            &mut self.buffer,
            self.config.read_timeout,
            Peer::Client,
        )
        .await?;
        if n == 0 {
            debug!(buffered = self.request.buffered(), "Client closed before completing a request head");
            self.closed_by = Some(Peer::Client);
            return Ok(SessionState::Done);
        }

        let (head, consumed) = match self.request.feed(&self.buffer[..n]).map_err(SessionError::Request)? {
            Feed::NeedMore => return Ok(SessionState::ReadingRequestHead),
            Feed::Head { head, consumed } => (head, consumed),
        };
        let body = self
            .request
            .consume_body(&self.buffer[consumed..n])
            .map_err(SessionError::Request)?;
        if consumed + body < n {
            debug!(ignored = n - consumed - body, "Dropping bytes past the declared request body");
        }

        self.upstream.extend_from_slice(&head.raw);
        self.upstream
            .extend_from_slice(&self.buffer[consumed..consumed + body]);
        self.response_kind = ResponseKind::for_method(&head.method);
        self.response = ResponseParser::response(self.response_kind, self.config.limits);

        info!(
            method = %head.method,
            target = %head.target,
            origin = %head.host,
            body = ?head.body,
            "Request head parsed"
        );
        Ok(SessionState::Connecting(head.host))
    }

    async fn connect(&mut self, host: Host) -> Result<SessionState, SessionError> {
        let origin = self.connector.connect(&host).await?;
        self.sockets.origin = Some(origin);
        Ok(SessionState::RelayingRequestBody)
    }

    async fn relay_request_body(&mut self) -> Result<SessionState, SessionError> {
        if !self.upstream.is_empty() {
            let origin = self.sockets.origin.as_mut().ok_or_else(not_connected)?;
            write_to(origin, &self.upstream, self.config.write_timeout, Peer::Origin).await?;
            self.bytes_to_origin += self.upstream.len() as u64;
            self.upstream.clear();
        }

        // The origin may answer before the body is done, e.g. `100 Continue`
        while !self.request.is_complete() {
            let SocketPair { client, origin } = &mut self.sockets;
            let origin = origin.as_mut().ok_or_else(not_connected)?;

            let from_client = tokio::select! {
                read = read_from(client, &mut self.buffer, self.config.read_timeout, Peer::Client) => Some(read?),
                ready = origin.readable() => {
                    ready.map_err(SessionError::Origin)?;
                    None
                }
            };

            match from_client {
                Some(0) => {
                    debug!("Client closed in the middle of the request body");
                    self.closed_by = Some(Peer::Client);
                    return Ok(SessionState::Done);
                }
                Some(n) => {
                    let take = self
                        .request
                        .consume_body(&self.buffer[..n])
                        .map_err(SessionError::Request)?;
                    write_to(origin, &self.buffer[..take], self.config.write_timeout, Peer::Origin).await?;
                    self.bytes_to_origin += take as u64;
                }
                None => {
                    let n = match origin.try_read(&mut self.buffer) {
                        Ok(0) => return Err(SessionError::OriginClosed),
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(SessionError::Origin(e)),
                    };
                    if let Some(next) = self.relay_response_bytes(n).await? {
                        debug!("Origin answered before the request body was complete");
                        return Ok(next);
                    }
                }
            }
        }

        Ok(SessionState::RelayingResponseHead)
    }

    async fn read_response_head(&mut self) -> Result<SessionState, SessionError> {
        let SocketPair { client, origin } = &mut self.sockets;
        let origin = origin.as_mut().ok_or_else(not_connected)?;

        let n = tokio::select! {
            read = read_from(origin, &mut self.buffer, self.config.read_timeout, Peer::Origin) => read?,
            hung_up = client_hung_up(client) => {
                hung_up?;
                debug!("Client hung up while waiting for the response head");
                self.closed_by = Some(Peer::Client);
                return Ok(SessionState::Done);
            }
        };
        if n == 0 {
            return Err(SessionError::OriginClosed);
        }

        Ok(self
            .relay_response_bytes(n)
            .await?
            .unwrap_or(SessionState::RelayingResponseHead))
    }

    /// Parses `self.buffer[..n]` from the origin and forwards every head it
    /// completes
    ///
    /// Interim (1xx) heads are passed through as they arrive and parsing
    /// starts over. Returns the next state once the final head is out, or
    /// `None` while it is still pending.
    async fn relay_response_bytes(&mut self, n: usize) -> Result<Option<SessionState>, SessionError> {
        let mut offset = 0;
        while offset < n {
            let (head, consumed) = match self
                .response
                .feed(&self.buffer[offset..n])
                .map_err(SessionError::Response)?
            {
                Feed::NeedMore => return Ok(None),
                Feed::Head { head, consumed } => (head, consumed),
            };
            let body_start = offset + consumed;

            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                debug!(status = %head.status, "Forwarding interim response");
                write_to(&mut self.sockets.client, &head.raw, self.config.write_timeout, Peer::Client).await?;
                self.bytes_to_client += head.raw.len() as u64;
                self.response = ResponseParser::response(self.response_kind, self.config.limits);
                offset = body_start;
                continue;
            }

            let body = self
                .response
                .consume_body(&self.buffer[body_start..n])
                .map_err(SessionError::Response)?;
            info!(status = %head.status, body = ?head.body, "Response head received");

            let client = &mut self.sockets.client;
            write_to(client, &head.raw, self.config.write_timeout, Peer::Client).await?;
            self.bytes_to_client += head.raw.len() as u64;
            if body > 0 {
                write_to(
                    client,
                    &self.buffer[body_start..body_start + body],
                    self.config.write_timeout,
                    Peer::Client,
                )
                .await?;
                self.bytes_to_client += body as u64;
            }

            return Ok(Some(if self.response.is_complete() {
                SessionState::Done
            } else {
                SessionState::RelayingResponseBody
            }));
        }
        Ok(None)
    }

    async fn relay_response_body(&mut self) -> Result<SessionState, SessionError> {
        let SocketPair { client, origin } = &mut self.sockets;
        let origin = origin.as_mut().ok_or_else(not_connected)?;

        while !self.response.is_complete() {
            let n = read_from(origin, &mut self.buffer, self.config.read_timeout, Peer::Origin).await?;
            if n == 0 {
                self.response.finish().map_err(SessionError::Response)?;
                break;
            }
            let take = self
                .response
                .consume_body(&self.buffer[..n])
                .map_err(SessionError::Response)?;
            write_to(client, &self.buffer[..take], self.config.write_timeout, Peer::Client).await?;
            self.bytes_to_client += take as u64;
        }

        Ok(SessionState::Done)
    }

    /// Writes a 502 when the failure calls for one and the client has not
    /// seen any response bytes yet
    async fn respond_to_failure(&mut self, error: &SessionError) -> bool {
        if error.policy() != FailurePolicy::BadGateway || self.bytes_to_client > 0 {
            return false;
        }
        match write_to(
            &mut self.sockets.client,
            BAD_GATEWAY,
            self.config.write_timeout,
            Peer::Client,
        )
        .await
        {
            Ok(()) => {
                self.bytes_to_client += BAD_GATEWAY.len() as u64;
                true
            }
            Err(e) => {
                debug!(error = %e, "Could not deliver 502 to client");
                false
            }
        }
    }
}

async fn read_from(
    stream: &mut TcpStream,
    buffer: &mut [u8],
    limit: Duration,
    peer: Peer,
) -> Result<usize, SessionError> {
    match timeout(limit, stream.read(buffer)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(peer.io_error(e)),
        Err(_) => Err(SessionError::Timeout(peer)),
    }
}

/// Resolves once the client hangs up; anything it sends meanwhile is dropped
async fn client_hung_up(client: &TcpStream) -> Result<(), SessionError> {
    let mut scratch = [0; 512];
    loop {
        client.readable().await.map_err(SessionError::Client)?;
        match client.try_read(&mut scratch) {
            Ok(0) => return Ok(()),
            Ok(n) => trace!(ignored = n, "Dropping bytes sent while awaiting the response"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(SessionError::Client(e)),
        }
    }
}

async fn write_to(
    stream: &mut TcpStream,
    data: &[u8],
    limit: Duration,
    peer: Peer,
) -> Result<(), SessionError> {
    match timeout(limit, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(peer.io_error(e)),
        Err(_) => Err(SessionError::Timeout(peer)),
    }
}
