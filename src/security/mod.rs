//! Resource ceilings applied to proxied traffic

pub mod limits;

pub use limits::Limits;
