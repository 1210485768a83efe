use crate::http::ParseError;

/// Size ceilings enforced by the HTTP parser
///
/// A single `Limits` value is fixed at startup and copied into every session;
/// nothing mutates it afterwards.
///
/// # Examples
///
/// ```
/// use fwdproxy::security::Limits;
///
/// let limits = Limits {
///     max_header_bytes: 4096,
///     ..Limits::default()
/// };
/// assert_eq!(limits.max_body_bytes, 10 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a message head, start line through the blank line
    pub max_header_bytes: usize,
    /// Maximum declared (or streamed) body size in bytes
    pub max_body_bytes: u64,
    /// Maximum number of header lines in one head
    pub max_headers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 8192,
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            max_headers: 100,
        }
    }
}

impl Limits {
    /// Checks the length of a head, in bytes
    pub fn check_head(&self, size: usize) -> Result<(), ParseError> {
        if size > self.max_header_bytes {
            Err(ParseError::HeadersTooLarge {
                size,
                max: self.max_header_bytes,
            })
        } else {
            Ok(())
        }
    }

    /// Checks a declared or running body length
    pub fn check_body(&self, size: u64) -> Result<(), ParseError> {
        if size > self.max_body_bytes {
            Err(ParseError::BodyTooLarge {
                size,
                max: self.max_body_bytes,
            })
        } else {
            Ok(())
        }
    }

    /// Number of bytes a head parser may buffer before it can tell the head is
    /// oversized
    pub(crate) fn head_buffer_cap(&self) -> usize {
        self.max_header_bytes.saturating_add(1)
    }
}
