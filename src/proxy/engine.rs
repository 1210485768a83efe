use super::connector::OriginConnector;
use super::session::{Session, SessionReport};
use crate::config::{ProxyConfig, SessionConfig};
use crate::{ProxyError, Result};
use futures_util::future::{FutureExt, LocalBoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Sleep, sleep};
use tracing::{Instrument, debug, error, info, warn};

/// Single-threaded forward proxy
///
/// Every session is polled by the future returned from [`ProxyServer::run`];
/// nothing is spawned, so all sessions are serviced on the thread that drives
/// that future.
///
/// # Examples
///
/// ```no_run
/// use fwdproxy::{ProxyConfigBuilder, ProxyServer};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ProxyConfigBuilder::new().port(8080).build()?;
///     let server = ProxyServer::bind(config).await?;
///     let shutdown = server.shutdown_signal();
///
///     tokio::select! {
///         result = server.run() => result?,
///         _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
///             let _ = shutdown.send(());
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    connector: OriginConnector,
    shutdown_signal: Arc<broadcast::Sender<()>>,
    reports: Option<mpsc::UnboundedSender<SessionReport>>,
}

impl ProxyServer {
    /// Validates `config` and binds the listening socket
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            ProxyError::Config(format!("Failed to bind {}: {e}", config.bind_addr))
        })?;
        let (shutdown_signal, _) = broadcast::channel(1);

        Ok(Self {
            connector: OriginConnector::new(config.connect_timeout),
            config,
            listener,
            shutdown_signal: Arc::new(shutdown_signal),
            reports: None,
        })
    }

    /// Address the listener actually bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sender that stops [`ProxyServer::run`] when sent to
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_signal.as_ref().clone()
    }

    /// Subscribes to the report of every finished session
    ///
    /// Only the most recent subscription receives reports.
    pub fn session_reports(&mut self) -> mpsc::UnboundedReceiver<SessionReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        rx
    }

    /// Accepts and services clients until a shutdown is requested
    pub async fn run(self) -> Result<()> {
        let ProxyServer {
            config,
            listener,
            connector,
            shutdown_signal,
            reports,
        } = self;

        let port = listener.local_addr()?.port();
        info!(
            process_id = std::process::id(),
            "Proxy server started on port {}, PID = {:?}",
            port,
            thread::current().id()
        );

        let session_config = SessionConfig::from(&config);
        debug!(
            connect_timeout = ?connector.connect_timeout(),
            read_timeout = ?session_config.read_timeout,
            write_timeout = ?session_config.write_timeout,
            max_connections = ?config.max_connections,
            "Session settings"
        );
        let mut registry = Registry::new(config.max_connections);
        let mut backoff: Option<Pin<Box<Sleep>>> = None;

        let mut internal = shutdown_signal.subscribe();
        let shutdown = shutdown_requested(&mut internal);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept(), if backoff.is_none() => match accepted {
                    Ok((stream, peer)) => registry.admit(stream, peer, session_config, connector),
                    Err(e) if is_resource_exhaustion(&e) => {
                        warn!(
                            error = %e,
                            in_flight = registry.len(),
                            pause = ?config.accept_backoff,
                            "Out of resources, pausing accept"
                        );
                        backoff = Some(Box::pin(sleep(config.accept_backoff)));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(report) = registry.sessions.next(), if !registry.is_empty() => {
                    finish(report, registry.len(), reports.as_ref());
                }
                () = backoff_elapsed(&mut backoff) => {
                    backoff = None;
                    debug!("Resuming accept");
                }
                source = &mut shutdown => {
                    info!(signal = source, "Received shutdown signal, stopping server");
                    break;
                }
            }
        }

        info!(dropped = registry.len(), "Proxy server stopped");
        Ok(())
    }
}

/// In-flight sessions, polled by the engine loop itself
struct Registry {
    sessions: FuturesUnordered<LocalBoxFuture<'static, SessionReport>>,
    max_connections: Option<usize>,
    next_id: u64,
}

impl Registry {
    fn new(max_connections: Option<usize>) -> Self {
        Self {
            sessions: FuturesUnordered::new(),
            max_connections,
            next_id: 0,
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        config: SessionConfig,
        connector: OriginConnector,
    ) {
        if let Some(limit) = self.max_connections {
            if self.len() >= limit {
                warn!(%peer, current = self.len(), limit, "Connection rejected: limit reached");
                return;
            }
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY on client socket");
        }

        self.next_id += 1;
        let session = Session::new(self.next_id, stream, peer, config, connector);
        self.insert(session);
        info!(%peer, current = self.len(), "Accepted connection");
    }

    fn insert(&mut self, session: Session) {
        let span = tracing::info_span!("session", id = session.id(), peer = %session.peer());
        self.sessions.push(session.run().instrument(span).boxed_local());
    }
}

fn finish(
    report: SessionReport,
    remaining: usize,
    reports: Option<&mpsc::UnboundedSender<SessionReport>>,
) {
    info!(
        id = report.id,
        peer = %report.peer,
        outcome = %report.outcome,
        to_origin = report.bytes_to_origin,
        to_client = report.bytes_to_client,
        elapsed = ?report.elapsed,
        current = remaining,
        "Connection closed"
    );
    if let Some(tx) = reports {
        // Nobody listening any more
        let _ = tx.send(report);
    }
}

async fn backoff_elapsed(backoff: &mut Option<Pin<Box<Sleep>>>) {
    match backoff {
        Some(pause) => pause.as_mut().await,
        None => future::pending().await,
    }
}

async fn shutdown_requested(internal: &mut broadcast::Receiver<()>) -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        Ok(()) = signal::ctrl_c() => "ctrl-c",
        () = terminate => "sigterm",
        Ok(()) = internal.recv() => "internal",
    }
}

/// Accept failures that go away once some descriptors or memory are released
#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}
