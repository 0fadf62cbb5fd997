//! Line protocol parsing and response formatting.
//!
//! ```text
//! Server:   Server is ready\n
//! Client:   3\n
//! Server:   Server returns: Dodge\n
//! Server:   Ready for a new request\n
//! Client:   0\n              (session ends)
//! ```
//!
//! A request line carries a number of seconds. The first run of digits in
//! the line is used, so `req=42;` is read as 42. The value is scaled to
//! milliseconds before it is used as both delay and registry key.

use bytes::BytesMut;

/// Milliseconds per requested unit
pub const MILLIS_PER_SECOND: u64 = 1000;

/// Longest request line accepted, excluding the line ending
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Sleep for `delay_ms`, then look up `delay_ms` in the registry.
    Work { delay_ms: u64 },
    /// The request scaled to zero; the session ends.
    Stop,
}

/// Reasons a request line is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// End of stream or an empty line.
    Missing,
    /// No usable integer in the line.
    Malformed(String),
    /// The integer is negative.
    Negative,
    /// The scaled value does not fit in a u64.
    TooLarge,
    /// The line exceeds `MAX_LINE_LENGTH`.
    LineTooLong,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Missing => write!(f, "client sent no data"),
            ParseError::Malformed(line) => write!(f, "malformed request {line:?}"),
            ParseError::Negative => write!(f, "negative request"),
            ParseError::TooLarge => write!(f, "request value too large"),
            ParseError::LineTooLong => write!(f, "request line longer than {MAX_LINE_LENGTH} bytes"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse one request line. `None` means the client closed the stream.
pub fn parse(line: Option<&str>) -> Result<Request, ParseError> {
    let line = line.ok_or(ParseError::Missing)?;
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ParseError::Missing);
    }

    let (digits, negative) =
        find_number(line).ok_or_else(|| ParseError::Malformed(line.to_string()))?;
    if negative {
        return Err(ParseError::Negative);
    }

    // `digits` is all ASCII digits, so failure here can only be overflow
    let seconds: u64 = digits.parse().map_err(|_| ParseError::TooLarge)?;
    let delay_ms = seconds
        .checked_mul(MILLIS_PER_SECOND)
        .ok_or(ParseError::TooLarge)?;

    if delay_ms == 0 {
        Ok(Request::Stop)
    } else {
        Ok(Request::Work { delay_ms })
    }
}

/// Find the first maximal run of ASCII digits, and whether a minus sign
/// directly precedes it.
fn find_number(line: &str) -> Option<(&str, bool)> {
    let start = line.find(|c: char| c.is_ascii_digit())?;
    let rest = &line[start..];
    let len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let negative = line[..start].ends_with('-');
    Some((&rest[..len], negative))
}

/// Response builder
pub struct Response;

impl Response {
    /// Greeting sent once when a session starts.
    pub fn greeting() -> &'static [u8] {
        b"Server is ready\n"
    }

    /// Lookup result followed by the readiness line.
    pub fn lookup_result(value: &str) -> BytesMut {
        let ready = Self::ready();
        let mut response = BytesMut::with_capacity(16 + value.len() + 1 + ready.len());
        response.extend_from_slice(b"Server returns: ");
        response.extend_from_slice(value.as_bytes());
        response.extend_from_slice(b"\n");
        response.extend_from_slice(ready);
        response
    }

    /// Line telling the client a new request can be sent.
    pub fn ready() -> &'static [u8] {
        b"Ready for a new request\n"
    }
}
