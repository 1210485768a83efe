use crate::config::ProxyConfig;
use crate::http::{Feed, ParserState, RequestHead, RequestParser};
use crate::proxy::{ProxyServer, SessionReport};
use crate::security::Limits;
use crate::{ProxyError, Result};
use std::io;
use std::net::SocketAddr;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

/// A proxy running on a dedicated thread with its own current-thread runtime
///
/// Dropping the handle asks the proxy to stop.
pub struct ProxyHandle {
    addr: SocketAddr,
    thread: ThreadId,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    shutdown: broadcast::Sender<()>,
    join: Option<thread::JoinHandle<Result<()>>>,
}

struct Ready {
    addr: SocketAddr,
    thread: ThreadId,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    shutdown: broadcast::Sender<()>,
}

impl ProxyHandle {
    /// Address clients should connect to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Thread the proxy loop runs on
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Waits for the next finished session
    pub async fn next_report(&mut self) -> Option<SessionReport> {
        timeout(Duration::from_secs(10), self.reports.recv())
            .await
            .ok()
            .flatten()
    }

    /// Stops the proxy and waits for its thread to exit
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| ProxyError::Config("proxy thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Starts a proxy with `config` on its own thread
pub async fn spawn_proxy(config: ProxyConfig) -> Result<ProxyHandle> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<Ready>>();

    let join = thread::Builder::new()
        .name("fwdproxy".to_string())
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let mut server = match ProxyServer::bind(config).await {
                    Ok(server) => server,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let ready = server.local_addr().map(|addr| Ready {
                    addr,
                    thread: thread::current().id(),
                    reports: server.session_reports(),
                    shutdown: server.shutdown_signal(),
                });
                let _ = ready_tx.send(ready);
                server.run().await
            })
        })?;

    let ready = ready_rx
        .await
        .map_err(|_| ProxyError::Config("proxy thread exited before binding".to_string()))??;
    info!(address = %ready.addr, "Test proxy listening");

    Ok(ProxyHandle {
        addr: ready.addr,
        thread: ready.thread,
        reports: ready.reports,
        shutdown: ready.shutdown,
        join: Some(join),
    })
}

/// A request as the origin received it
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
    /// Every byte read off the socket, head and body
    pub raw: Vec<u8>,
}

/// Reads exactly one request off `stream`
pub async fn read_request(stream: &mut TcpStream) -> Result<OriginRequest> {
    let mut parser = RequestParser::request(Limits::default());
    let mut buffer = [0u8; 4096];
    let mut raw = Vec::new();
    let mut head = None;
    let mut body = Vec::new();

    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            return Err(ProxyError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        raw.extend_from_slice(&buffer[..n]);

        let body_start = match parser.state() {
            ParserState::AwaitingHeadLine | ParserState::AwaitingHeaders => {
                match parser.feed(&buffer[..n]).map_err(invalid_data)? {
                    Feed::NeedMore => continue,
                    Feed::Head { head: parsed, consumed } => {
                        head = Some(parsed);
                        consumed
                    }
                }
            }
            _ => 0,
        };
        let take = parser.consume_body(&buffer[body_start..n]).map_err(invalid_data)?;
        body.extend_from_slice(&buffer[body_start..body_start + take]);

        if parser.is_complete() {
            break;
        }
    }

    let head = head.ok_or_else(|| invalid_data("request ended without a head"))?;
    Ok(OriginRequest { head, body, raw })
}

fn invalid_data(err: impl ToString) -> ProxyError {
    ProxyError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

/// A scripted origin server; every accepted connection gets one response
pub struct OriginServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<OriginRequest>,
    task: JoinHandle<()>,
}

impl OriginServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the next request the origin answered
    pub async fn next_request(&mut self) -> Option<OriginRequest> {
        timeout(Duration::from_secs(10), self.requests.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts an origin on the current runtime that answers each request with
/// whatever `respond` returns, then closes the connection
pub async fn spawn_origin<F>(respond: F) -> Result<OriginServer>
where
    F: Fn(&OriginRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, requests) = mpsc::unbounded_channel();
    let respond = std::sync::Arc::new(respond);

    let task = tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = %e, "Test origin failed to accept");
                    continue;
                }
            };
            let respond = respond.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let request = match read_request(&mut stream).await {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(%peer, error = %e, "Test origin dropped a request");
                        return;
                    }
                };
                let response = respond(&request);
                let _ = tx.send(request);
                if let Err(e) = stream.write_all(&response).await {
                    debug!(%peer, error = %e, "Test origin failed to respond");
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    Ok(OriginServer {
        addr,
        requests,
        task,
    })
}

/// A `200 OK` response carrying `body`
pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// A loopback address nothing listens on
pub fn unreachable_addr() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// Sends `request` through the proxy at `proxy` and collects everything it
/// writes back before closing
///
/// A reset from the proxy counts as the end of the response.
pub async fn send_raw(proxy: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    if let Err(e) = stream.write_all(request).await {
        if !is_reset(&e) {
            return Err(e.into());
        }
    }

    let mut response = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let read = timeout(Duration::from_secs(10), stream.read(&mut buffer))
            .await
            .map_err(|_| ProxyError::Timeout("proxy kept the connection open".to_string()))?;
        match read {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buffer[..n]),
            Err(e) if is_reset(&e) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(response)
}

fn is_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}
