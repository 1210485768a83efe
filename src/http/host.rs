use super::ParseError;
use http::header::{HOST, HeaderName, HeaderValue};
use http::uri::{Authority, Scheme, Uri};
use std::fmt;

/// Origin address named by a request
///
/// IPv6 literals are kept without brackets; `Display` adds them back so the
/// rendered form can be handed straight to a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    name: String,
    port: u16,
}

impl Host {
    /// Port assumed when neither the target nor the `Host` header names one
    pub const DEFAULT_PORT: u16 = 80;

    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the origin of a request from its target and headers
    ///
    /// An absolute-URI target wins over the `Host` header. A request naming
    /// neither fails with [`ParseError::MissingHost`].
    pub fn resolve(target: &str, headers: &[(HeaderName, HeaderValue)]) -> Result<Self, ParseError> {
        if let Some(host) = Self::from_target(target) {
            return Ok(host);
        }

        let mut found: Option<&HeaderValue> = None;
        for (name, value) in headers {
            if *name != HOST {
                continue;
            }
            match found {
                Some(previous) if previous != value => {
                    return Err(ParseError::Malformed(
                        "conflicting Host headers".to_string(),
                    ));
                }
                _ => found = Some(value),
            }
        }

        found
            .and_then(|value| Self::from_header_value(value.as_bytes()))
            .ok_or(ParseError::MissingHost)
    }

    /// Extracts the authority of an absolute-URI request target
    pub fn from_target(target: &str) -> Option<Self> {
        if target.starts_with('/') || target == "*" {
            return None;
        }
        let uri: Uri = target.parse().ok()?;
        let scheme = uri.scheme()?;
        let default_port = if *scheme == Scheme::HTTPS { 443 } else { Self::DEFAULT_PORT };
        Self::from_authority(uri.authority()?, default_port)
    }

    /// Parses a `Host` header value such as `example.com:8080`
    pub fn from_header_value(value: &[u8]) -> Option<Self> {
        let authority = Authority::try_from(value.trim_ascii()).ok()?;
        Self::from_authority(&authority, Self::DEFAULT_PORT)
    }

    fn from_authority(authority: &Authority, default_port: u16) -> Option<Self> {
        let name = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']');
        if name.is_empty() {
            return None;
        }
        let port = authority.port_u16().unwrap_or(default_port);
        Some(Self::new(name, port))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}
