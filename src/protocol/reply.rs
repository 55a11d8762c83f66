//! RESP Reply Values
//!
//! Replies written back to clients. Every type starts with a prefix byte and
//! ends with CRLF:
//!
//! ```text
//! +OK\r\n                     simple string
//! -ERR unknown command\r\n    error
//! :1000\r\n                   integer
//! $5\r\nhello\r\n             bulk string
//! $-1\r\n                     null
//! *2\r\n:1\r\n:2\r\n          array
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Type prefix bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`, must not contain CR or LF.
    SimpleString(String),

    /// `-<message>\r\n`. By convention the first word is an error code
    /// such as `ERR`, `WRONGTYPE` or `MISCONF`.
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe.
    BulkString(Bytes),

    /// `$-1\r\n`
    Null,

    /// `*<count>\r\n<element>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates an error reply.
    ///
    /// # Example
    /// ```
    /// use emberkv::protocol::RespValue;
    /// let err = RespValue::error("ERR unknown command 'FOO'");
    /// assert!(err.is_error());
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// `ERR wrong number of arguments for '<name>' command`
    pub fn wrong_arity(name: &str) -> Self {
        RespValue::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        ))
    }

    pub fn wrong_type() -> Self {
        RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
    }

    pub fn not_integer() -> Self {
        RespValue::error("ERR value is not an integer or out of range")
    }

    pub fn syntax_error() -> Self {
        RespValue::error("ERR syntax error")
    }

    /// Serializes into a fresh buffer.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Appends the wire form to `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.put_u8(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.put_u8(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.put_u8(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(values) => {
                buf.put_u8(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) if values.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(values) => {
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_and_error_serialize() {
        assert_eq!(&RespValue::ok().serialize()[..], b"+OK\r\n");
        assert_eq!(
            &RespValue::error("ERR unknown command").serialize()[..],
            b"-ERR unknown command\r\n"
        );
    }

    #[test]
    fn test_integer_serialize() {
        assert_eq!(&RespValue::integer(-42).serialize()[..], b":-42\r\n");
    }

    #[test]
    fn test_bulk_and_null_serialize() {
        assert_eq!(&RespValue::bulk_string("hello").serialize()[..], b"$5\r\nhello\r\n");
        assert_eq!(&RespValue::bulk_string("").serialize()[..], b"$0\r\n\r\n");
        assert_eq!(&RespValue::null().serialize()[..], b"$-1\r\n");
    }

    #[test]
    fn test_nested_array_serialize() {
        let value = RespValue::array(vec![
            RespValue::integer(1),
            RespValue::array(vec![RespValue::bulk_string("a"), RespValue::Null]),
        ]);
        assert_eq!(&value.serialize()[..], b"*2\r\n:1\r\n*2\r\n$1\r\na\r\n$-1\r\n");
    }

    #[test]
    fn test_wrong_arity_message() {
        assert_eq!(
            RespValue::wrong_arity("GET"),
            RespValue::Error("ERR wrong number of arguments for 'get' command".to_string())
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(RespValue::integer(3).to_string(), "(integer) 3");
        assert_eq!(RespValue::Null.to_string(), "(nil)");
        let arr = RespValue::array(vec![RespValue::bulk_string("a"), RespValue::bulk_string("b")]);
        assert_eq!(arr.to_string(), "1) \"a\"\n2) \"b\"");
    }
}
