//! Incremental Request Decoder
//!
//! Turns a byte buffer into argument vectors. The decoder never consumes
//! input itself; it reports how many bytes a complete request used:
//!
//! - `Ok(Some((argv, consumed)))`: one request decoded
//! - `Ok(None)`: incomplete, wait for more bytes
//! - `Err(ParseError)`: malformed input
//!
//! Two modes exist. Clients may send inline commands (`PING\r\n`) as well as
//! multi-bulk requests; the append-only log only ever contains multi-bulk
//! records, so the loader decodes strictly and treats anything else as
//! corruption.

use super::reply::{prefix, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Strict mode: a record did not start with `*`.
    #[error("expected '*', got {0:#04x}")]
    ExpectedMultibulk(u8),

    /// An argument did not start with `$`.
    #[error("expected '$', got {0:#04x}")]
    ExpectedBulk(u8),

    #[error("invalid multibulk length: {0}")]
    InvalidMultibulkLength(i64),

    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Bulk payload not followed by CRLF.
    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("request too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size of a single argument (512 MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of arguments in one request.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

/// Maximum length of an inline command line.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Which request forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Multi-bulk and inline requests.
    #[default]
    Lenient,
    /// Multi-bulk with at least one argument, nothing else.
    Strict,
}

/// Decoded arguments plus the number of bytes they used.
pub type Decoded = (Vec<Bytes>, usize);

/// Stateless request decoder.
///
/// # Example
///
/// ```
/// use emberkv::protocol::CommandDecoder;
///
/// let decoder = CommandDecoder::lenient();
/// let (argv, consumed) = decoder
///     .decode(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(argv, vec!["GET", "name"]);
/// assert_eq!(consumed, 23);
///
/// assert!(decoder.decode(b"*2\r\n$3\r\nGET\r\n").unwrap().is_none());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDecoder {
    mode: DecodeMode,
}

impl CommandDecoder {
    pub fn new(mode: DecodeMode) -> Self {
        Self { mode }
    }

    pub fn lenient() -> Self {
        Self::new(DecodeMode::Lenient)
    }

    pub fn strict() -> Self {
        Self::new(DecodeMode::Strict)
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Attempts to decode one request from the front of `buf`.
    ///
    /// In lenient mode an empty request (`*0\r\n` or a blank line) decodes to
    /// an empty vector, which callers skip.
    pub fn decode(&self, buf: &[u8]) -> ParseResult<Option<Decoded>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        match (first, self.mode) {
            (prefix::ARRAY, _) => self.decode_multibulk(buf),
            (other, DecodeMode::Strict) => Err(ParseError::ExpectedMultibulk(other)),
            (_, DecodeMode::Lenient) => decode_inline(buf),
        }
    }

    fn decode_multibulk(&self, buf: &[u8]) -> ParseResult<Option<Decoded>> {
        let Some((line, mut pos)) = read_line(buf, 1) else {
            return Ok(None);
        };
        let count = parse_int(line)?;
        if count > MAX_MULTIBULK_LEN {
            return Err(ParseError::InvalidMultibulkLength(count));
        }
        if count <= 0 {
            return match self.mode {
                DecodeMode::Strict => Err(ParseError::InvalidMultibulkLength(count)),
                DecodeMode::Lenient => Ok(Some((Vec::new(), pos))),
            };
        }

        let mut argv = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(&byte) = buf.get(pos) else {
                return Ok(None);
            };
            if byte != prefix::BULK_STRING {
                return Err(ParseError::ExpectedBulk(byte));
            }
            let Some((line, data_start)) = read_line(buf, pos + 1) else {
                return Ok(None);
            };
            let len = parse_int(line)?;
            if len < 0 || len as usize > MAX_BULK_SIZE {
                return Err(ParseError::InvalidBulkLength(len));
            }
            let len = len as usize;
            let end = data_start + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != CRLF {
                return Err(ParseError::MissingCrlf);
            }
            argv.push(Bytes::copy_from_slice(&buf[data_start..end]));
            pos = end + 2;
        }
        Ok(Some((argv, pos)))
    }
}

/// Whitespace-separated arguments terminated by LF, with an optional CR.
fn decode_inline(buf: &[u8]) -> ParseResult<Option<Decoded>> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_INLINE_SIZE {
            return Err(ParseError::TooLarge {
                size: buf.len(),
                max: MAX_INLINE_SIZE,
            });
        }
        return Ok(None);
    };
    let line = buf[..newline].strip_suffix(b"\r").unwrap_or(&buf[..newline]);
    let argv = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    Ok(Some((argv, newline + 1)))
}

/// Returns the line starting at `start` (without CRLF) and the offset just
/// past its terminator.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let pos = find_crlf(rest)?;
    Some((&rest[..pos], start + pos + 2))
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

fn parse_int(line: &[u8]) -> ParseResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}
