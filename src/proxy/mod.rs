//! The forwarding side of the proxy
//!
//! [`ProxyServer`] accepts clients and polls one [`Session`] per client from a
//! single future. A session reads one request head, connects to the origin it
//! names through the [`OriginConnector`], forwards the request and relays
//! exactly one response back before closing both sockets.

pub mod connector;
pub mod engine;
pub mod session;


pub use connector::{ConnectError, OriginConnector};
pub use engine::ProxyServer;
pub use session::{
    BAD_GATEWAY, FailurePolicy, Peer, Session, SessionError, SessionOutcome, SessionReport,
    SessionState,
};
