use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Hex digits of a chunk-size line
    Size,
    /// Chunk extensions or whitespace up to the line's CR
    Extension,
    SizeLf,
    Data(u64),
    DataCr,
    DataLf,
    /// Start of a trailer line, or the final CRLF
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Done,
}

/// Tracks message boundaries of a `chunked` body without decoding it
///
/// Bytes are only scanned, never copied, so the caller can forward them as
/// they were received. Every framing byte counts towards `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedBody {
    step: Step,
    size: u64,
    digits: usize,
    received: u64,
}

impl Default for ChunkedBody {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedBody {
    pub fn new() -> Self {
        Self {
            step: Step::Size,
            size: 0,
            digits: 0,
            received: 0,
        }
    }

    /// Bytes of the body seen so far, framing included
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether the last chunk and trailer section have been seen
    pub fn is_done(&self) -> bool {
        self.step == Step::Done
    }

    /// Data bytes still owed by the chunk being read
    pub fn pending_data(&self) -> u64 {
        match self.step {
            Step::Data(n) => n,
            _ => 0,
        }
    }

    /// Scans `bytes` and returns how many of them belong to this body
    ///
    /// Stops right after the final CRLF; anything past it is not consumed.
    pub fn advance(&mut self, bytes: &[u8]) -> Result<usize, ParseError> {
        let mut i = 0;
        while i < bytes.len() && self.step != Step::Done {
            if let Step::Data(remaining) = self.step {
                let take = remaining.min((bytes.len() - i) as u64);
                i += take as usize;
                self.step = if take == remaining {
                    Step::DataCr
                } else {
                    Step::Data(remaining - take)
                };
                continue;
            }

            let byte = bytes[i];
            i += 1;
            self.step = match (self.step, byte) {
                (Step::Size, b) if b.is_ascii_hexdigit() => {
                    self.push_digit(b)?;
                    Step::Size
                }
                (Step::Size, b';' | b' ' | b'\t') if self.digits > 0 => Step::Extension,
                (Step::Size | Step::Extension, b'\r') if self.digits > 0 => Step::SizeLf,
                (Step::Extension, b'\n') => return Err(malformed("bare LF in chunk extension")),
                (Step::Extension, _) => Step::Extension,
                (Step::SizeLf, b'\n') if self.size == 0 => Step::TrailerStart,
                (Step::SizeLf, b'\n') => Step::Data(self.size),
                (Step::DataCr, b'\r') => Step::DataLf,
                (Step::DataLf, b'\n') => {
                    self.size = 0;
                    self.digits = 0;
                    Step::Size
                }
                (Step::TrailerStart, b'\r') => Step::EndLf,
                (Step::TrailerStart | Step::Trailer, b'\r') => Step::TrailerLf,
                (Step::TrailerStart | Step::Trailer, _) => Step::Trailer,
                (Step::TrailerLf, b'\n') => Step::TrailerStart,
                (Step::EndLf, b'\n') => Step::Done,
                (Step::Size, _) => return Err(malformed("invalid chunk size")),
                (Step::SizeLf | Step::DataLf | Step::TrailerLf | Step::EndLf, _) => {
                    return Err(malformed("expected LF"));
                }
                (Step::DataCr, _) => return Err(malformed("chunk data longer than its size")),
                (Step::Data(_) | Step::Done, _) => {
                    return Err(ParseError::InvalidState("chunk scanner out of step"));
                }
            };
        }
        self.received += i as u64;
        Ok(i)
    }

    fn push_digit(&mut self, byte: u8) -> Result<(), ParseError> {
        let digit = (byte as char).to_digit(16).unwrap_or(0) as u64;
        self.size = self
            .size
            .checked_mul(16)
            .and_then(|size| size.checked_add(digit))
            .ok_or_else(|| malformed("chunk size overflows"))?;
        self.digits += 1;
        Ok(())
    }
}

fn malformed(reason: &str) -> ParseError {
    ParseError::Malformed(reason.to_string())
}
