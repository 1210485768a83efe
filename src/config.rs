use crate::security::Limits;
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the proxy server
///
/// # Examples
///
/// ```
/// use fwdproxy::ProxyConfig;
/// use fwdproxy::security::Limits;
/// use std::time::Duration;
///
/// let config = ProxyConfig {
///     bind_addr: "127.0.0.1:5555".parse().unwrap(),
///     max_connections: None,
///     buffer_size: 8192,
///     read_timeout: Duration::from_secs(30),
///     write_timeout: Duration::from_secs(30),
///     connect_timeout: Duration::from_secs(10),
///     accept_backoff: Duration::from_millis(100),
///     limits: Limits::default(),
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// Ceiling on concurrent sessions; `None` leaves it to the OS descriptor limit
    pub max_connections: Option<usize>,
    /// Size of each session's read buffer
    pub buffer_size: usize,
    /// Longest wait for a single read on either socket
    pub read_timeout: Duration,
    /// Longest wait for a single write on either socket
    pub write_timeout: Duration,
    /// Longest wait for resolving and connecting to an origin
    pub connect_timeout: Duration,
    /// Pause applied to accepting after the process runs out of descriptors
    pub accept_backoff: Duration,
    /// Head and body size ceilings
    pub limits: Limits,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: None,
            buffer_size: 8192,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            accept_backoff: Duration::from_millis(100),
            limits: Limits::default(),
        }
    }
}

impl ProxyConfig {
    /// Rejects settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ProxyError::Config("buffer_size must be non-zero".to_string()));
        }
        if self.limits.max_header_bytes == 0 {
            return Err(ProxyError::Config(
                "max_header_bytes must be non-zero".to_string(),
            ));
        }
        if self.limits.max_headers == 0 {
            return Err(ProxyError::Config("max_headers must be non-zero".to_string()));
        }
        if self.max_connections == Some(0) {
            return Err(ProxyError::Config(
                "max_connections must be non-zero when set".to_string(),
            ));
        }
        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(ProxyError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// The part of [`ProxyConfig`] every session carries
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub limits: Limits,
}

impl From<&ProxyConfig> for SessionConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            limits: config.limits,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

/// Builder for proxy configuration
pub struct ProxyConfigBuilder {
    config: ProxyConfig,
}

impl ProxyConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
        }
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Listen on every IPv4 interface at `port`
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.config.accept_backoff = backoff;
        self
    }

    pub fn max_header_bytes(mut self, max: usize) -> Self {
        self.config.limits.max_header_bytes = max;
        self
    }

    pub fn max_body_bytes(mut self, max: u64) -> Self {
        self.config.limits.max_body_bytes = max;
        self
    }

    pub fn max_headers(mut self, max: usize) -> Self {
        self.config.limits.max_headers = max;
        self
    }

    pub fn build(self) -> Result<ProxyConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ProxyConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
