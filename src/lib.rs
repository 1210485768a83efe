use thiserror::Error;

/// Error types for the fwdproxy library
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP-related errors (bind, accept, local address)
    #[error("TCP error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Result type for the fwdproxy library
pub type Result<T> = std::result::Result<T, ProxyError>;

pub mod common;
pub mod config;
pub mod http;
pub mod proxy;
pub mod security;

// Re-export main types for convenience
pub use config::{ProxyConfig, ProxyConfigBuilder, SessionConfig};
pub use self::http::{Host, ParseError, RequestParser, ResponseParser};
pub use proxy::{OriginConnector, ProxyServer, SessionOutcome, SessionReport};
pub use security::Limits;
