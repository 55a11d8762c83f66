//! Log record encoding.
//!
//! Every record is a multi-bulk command:
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<bytes>\r\n      (argc times)
//! ```
//!
//! Commands carrying a relative expiry are rewritten into absolute form
//! before they are logged, so replaying the log later produces the same
//! deadlines no matter when it is replayed.

use crate::commands::{lookup_command, parse_i64, ExpiryKind};
use bytes::{BufMut, Bytes, BytesMut};

/// Appends one multi-bulk command to `buf`.
///
/// # Example
///
/// ```
/// use emberkv::aof::encoding::cat_command;
/// use bytes::{Bytes, BytesMut};
///
/// let mut buf = BytesMut::new();
/// cat_command(&mut buf, &[Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")]);
/// assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
/// ```
pub fn cat_command<A: AsRef<[u8]>>(buf: &mut BytesMut, argv: &[A]) {
    put_header(buf, b'*', argv.len());
    for arg in argv {
        let arg = arg.as_ref();
        put_header(buf, b'$', arg.len());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

fn put_header(buf: &mut BytesMut, prefix: u8, n: usize) {
    buf.put_u8(prefix);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

/// Appends `SELECT <db>`.
pub fn cat_select(buf: &mut BytesMut, db: usize) {
    cat_command(buf, &[b"SELECT".as_slice(), db.to_string().as_bytes()]);
}

/// Appends `PEXPIREAT <key> <when_ms>`.
pub fn cat_pexpireat(buf: &mut BytesMut, key: &[u8], when_ms: i64) {
    cat_command(buf, &[b"PEXPIREAT".as_slice(), key, when_ms.to_string().as_bytes()]);
}

/// Appends the log form of `argv`, executed at `now_ms`.
///
/// - `EXPIRE`, `PEXPIRE`, `EXPIREAT` become `PEXPIREAT key <abs-ms>`
/// - `SETEX`, `PSETEX` and `SET ... EX|PX` become `SET key value` followed
///   by `PEXPIREAT`; other `SET` options are dropped
/// - everything else is written verbatim
pub fn cat_translated(buf: &mut BytesMut, argv: &[Bytes], now_ms: i64) {
    let kind = argv
        .first()
        .and_then(|name| lookup_command(name))
        .map_or(ExpiryKind::None, |spec| spec.expiry);

    let translated = match kind {
        ExpiryKind::None | ExpiryKind::AbsoluteMillis => None,
        ExpiryKind::RelativeSecs => expire_at(argv, now_ms, 1000).map(|when| (None, when)),
        ExpiryKind::RelativeMillis => expire_at(argv, now_ms, 1).map(|when| (None, when)),
        ExpiryKind::AbsoluteSecs => expire_at(argv, 0, 1000).map(|when| (None, when)),
        ExpiryKind::SetExSecs => setex_at(argv, now_ms, 1000),
        ExpiryKind::SetExMillis => setex_at(argv, now_ms, 1),
        ExpiryKind::SetOptions => set_options_at(argv, now_ms),
    };

    match translated {
        None => cat_command(buf, argv),
        Some((set_value, when)) => {
            let key = &argv[1];
            if let Some(value) = set_value {
                cat_command(buf, &[b"SET".as_slice(), &key[..], &value[..]]);
            }
            cat_pexpireat(buf, key, when);
        }
    }
}

/// `CMD key amount` -> deadline.
fn expire_at(argv: &[Bytes], base_ms: i64, unit: i64) -> Option<i64> {
    let [_, _, amount] = argv else {
        return None;
    };
    parse_i64(amount)?.checked_mul(unit)?.checked_add(base_ms)
}

/// `SETEX key amount value` -> (value, deadline).
fn setex_at(argv: &[Bytes], now_ms: i64, unit: i64) -> Option<(Option<&Bytes>, i64)> {
    let [_, _, amount, value] = argv else {
        return None;
    };
    let when = parse_i64(amount)?.checked_mul(unit)?.checked_add(now_ms)?;
    Some((Some(value), when))
}

/// `SET key value [options]` -> (value, deadline) when an `EX` or `PX`
/// option is present.
fn set_options_at(argv: &[Bytes], now_ms: i64) -> Option<(Option<&Bytes>, i64)> {
    let value = argv.get(2)?;
    let mut i = 3;
    while i < argv.len() {
        let unit = if argv[i].eq_ignore_ascii_case(b"EX") {
            Some(1000)
        } else if argv[i].eq_ignore_ascii_case(b"PX") {
            Some(1)
        } else {
            None
        };
        if let Some(unit) = unit {
            let amount = parse_i64(argv.get(i + 1)?)?;
            let when = amount.checked_mul(unit)?.checked_add(now_ms)?;
            return Some((Some(value), when));
        }
        i += 1;
    }
    None
}
