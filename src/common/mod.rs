//! Helpers shared by unit tests, integration tests and benchmarks
//!
//! This module runs a proxy on a thread of its own and provides a scripted
//! origin server to forward to.

pub mod test_utils;

pub use test_utils::{
    OriginRequest, OriginServer, ProxyHandle, ok_response, read_request, send_raw, spawn_origin,
    spawn_proxy, unreachable_addr,
};
