use crate::http::Host;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{host} resolved to no addresses")]
    NoAddresses { host: String },
    #[error("Failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("Connecting to {host} timed out after {timeout:?}")]
    TimedOut { host: String, timeout: Duration },
}

/// Opens outbound connections to origins
///
/// Resolution and every connection attempt share a single deadline; resolved
/// addresses are tried in order until one accepts.
#[derive(Debug, Clone, Copy)]
pub struct OriginConnector {
    connect_timeout: Duration,
}

impl OriginConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub async fn connect(&self, host: &Host) -> Result<TcpStream, ConnectError> {
        match timeout(self.connect_timeout, connect_any(host)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::TimedOut {
                host: host.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }
}

async fn connect_any(host: &Host) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = lookup_host((host.name(), host.port()))
        .await
        .map_err(|source| ConnectError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%addr, error = %e, "Failed to set TCP_NODELAY on origin socket");
                }
                debug!(%addr, origin = %host, "Connected to origin");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, origin = %host, error = %e, "Origin address refused connection");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => Err(ConnectError::Connect {
            host: host.to_string(),
            source,
        }),
        None => Err(ConnectError::NoAddresses {
            host: host.to_string(),
        }),
    }
}
