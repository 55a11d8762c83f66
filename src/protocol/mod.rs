//! RESP Protocol
//!
//! The client-facing half of the wire format: [`CommandDecoder`] turns
//! request bytes into argument vectors, [`RespValue`] encodes replies.
//!
//! The append-only log reuses the request encoding (a multi-bulk array of
//! bulk strings per command), so the loader replays it with the same
//! decoder in strict mode.
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::{CommandDecoder, RespValue};
//!
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (argv, consumed) = CommandDecoder::lenient().decode(data).unwrap().unwrap();
//! assert_eq!(argv.len(), 2);
//! assert_eq!(consumed, data.len());
//!
//! let reply = RespValue::bulk_string("Ariz");
//! assert_eq!(&reply.serialize()[..], b"$4\r\nAriz\r\n");
//! ```

pub mod decoder;
pub mod reply;

pub use decoder::{CommandDecoder, DecodeMode, ParseError, ParseResult};
pub use reply::RespValue;
