//! # Memcache Text Protocol Codec
//!
//! Purpose: Frame client requests as ASCII command lines and decode the
//! server's line-oriented replies, including streamed `VALUE` blocks.
//!
//! ## Design Principles
//! 1. **State-Free Decoding**: Each reply kind is read top-down by one
//!    function; the caller decides which reply to expect.
//! 2. **Buffer Reuse**: Callers hand in the encode buffer and line buffer.
//! 3. **Binary-Safe Payloads**: Values are length-prefixed raw bytes.
//! 4. **Noreply Awareness**: `Request::expects_reply` tells the caller whether
//!    a status line will ever arrive.
//!
//! ## Wire Format
//!
//! ```text
//! storage:   <verb> <key> <flags> <exptime> <bytes> [<cas>] [noreply]\r\n<data>\r\n
//! retrieval: gets <key>*\r\n
//!            -> (VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\n)* END\r\n
//! delete:    delete <key> [noreply]\r\n        -> DELETED | NOT_FOUND
//! counters:  incr|decr <key> <delta>\r\n       -> <value> | NOT_FOUND
//! touch:     touch <key> <exptime>\r\n         -> TOUCHED | NOT_FOUND
//! flush:     flush_all [<delay>] [noreply]\r\n -> OK
//! version:   version\r\n                       -> VERSION <text>
//! ```

use std::io::{self, BufRead, Read};

use bytes::{BufMut, BytesMut};

use crate::error::{McError, McResult};
use crate::types::Item;

/// Largest value length accepted in a `VALUE` header.
///
/// memcached caps items at 1 MiB by default and 1 GiB at most; anything
/// beyond that is treated as a corrupt header rather than allocated.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;

/// Longest reply line accepted, terminator included.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Value buffers start at most this large and grow as payload arrives.
const INITIAL_VALUE_CAPACITY: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";
const NOREPLY: &[u8] = b" noreply";

/// Storage verbs that share the `<verb> <key> <flags> <exptime> <bytes>` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Append to an existing value.
    Append,
    /// Prepend to an existing value.
    Prepend,
}

impl StoreVerb {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            StoreVerb::Set => b"set",
            StoreVerb::Add => b"add",
            StoreVerb::Replace => b"replace",
            StoreVerb::Append => b"append",
            StoreVerb::Prepend => b"prepend",
        }
    }
}

/// One client request, borrowing keys and items from the caller.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// `gets k1 k2 ...`; a single line may name many keys.
    Gets { keys: &'a [&'a str] },
    /// `set`/`add`/`replace`/`append`/`prepend`.
    Store {
        verb: StoreVerb,
        item: &'a Item,
        noreply: bool,
    },
    /// `cas` with an explicit token.
    Cas {
        item: &'a Item,
        cas: u64,
        noreply: bool,
    },
    /// `delete <key>`.
    Delete { key: &'a str, noreply: bool },
    /// `incr <key> <delta>`.
    Incr { key: &'a str, delta: u64 },
    /// `decr <key> <delta>`.
    Decr { key: &'a str, delta: u64 },
    /// `touch <key> <exptime>`.
    Touch { key: &'a str, expiration: i32 },
    /// `flush_all [<delay>]`.
    FlushAll { delay: u32, noreply: bool },
    /// `version`.
    Version,
}

impl Request<'_> {
    /// Returns false when the request carries `noreply` and the server will
    /// not send a status line.
    pub fn expects_reply(&self) -> bool {
        match self {
            Request::Store { noreply, .. }
            | Request::Cas { noreply, .. }
            | Request::Delete { noreply, .. }
            | Request::FlushAll { noreply, .. } => !noreply,
            _ => true,
        }
    }

    /// Appends the wire form of this request to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match *self {
            Request::Gets { keys } => {
                out.put_slice(b"gets");
                for key in keys {
                    out.put_u8(b' ');
                    out.put_slice(key.as_bytes());
                }
                out.put_slice(CRLF);
            }
            Request::Store {
                verb,
                item,
                noreply,
            } => encode_storage(out, verb.as_bytes(), item, None, noreply),
            Request::Cas { item, cas, noreply } => {
                encode_storage(out, b"cas", item, Some(cas), noreply)
            }
            Request::Delete { key, noreply } => {
                out.put_slice(b"delete ");
                out.put_slice(key.as_bytes());
                if noreply {
                    out.put_slice(NOREPLY);
                }
                out.put_slice(CRLF);
            }
            Request::Incr { key, delta } => encode_arith(out, b"incr ", key, delta),
            Request::Decr { key, delta } => encode_arith(out, b"decr ", key, delta),
            Request::Touch { key, expiration } => {
                out.put_slice(b"touch ");
                out.put_slice(key.as_bytes());
                out.put_u8(b' ');
                push_i64(out, i64::from(expiration));
                out.put_slice(CRLF);
            }
            Request::FlushAll { delay, noreply } => {
                out.put_slice(b"flush_all");
                if delay > 0 {
                    out.put_u8(b' ');
                    push_u64(out, u64::from(delay));
                }
                if noreply {
                    out.put_slice(NOREPLY);
                }
                out.put_slice(CRLF);
            }
            Request::Version => out.put_slice(b"version\r\n"),
        }
    }
}

fn encode_storage(out: &mut BytesMut, verb: &[u8], item: &Item, cas: Option<u64>, noreply: bool) {
    out.reserve(verb.len() + item.key.len() + item.value.len() + 64);
    out.put_slice(verb);
    out.put_u8(b' ');
    out.put_slice(item.key.as_bytes());
    out.put_u8(b' ');
    push_u64(out, u64::from(item.flags));
    out.put_u8(b' ');
    push_i64(out, i64::from(item.expiration));
    out.put_u8(b' ');
    push_u64(out, item.value.len() as u64);
    if let Some(cas) = cas {
        out.put_u8(b' ');
        push_u64(out, cas);
    }
    if noreply {
        out.put_slice(NOREPLY);
    }
    out.put_slice(CRLF);
    out.put_slice(&item.value);
    out.put_slice(CRLF);
}

fn encode_arith(out: &mut BytesMut, verb: &[u8], key: &str, delta: u64) {
    out.put_slice(verb);
    out.put_slice(key.as_bytes());
    out.put_u8(b' ');
    push_u64(out, delta);
    out.put_slice(CRLF);
}

/// Reads `VALUE` blocks until `END`, handing each decoded item to `on_item`.
///
/// Keys the server does not hold simply produce no block.
pub fn read_values<R, F>(reader: &mut R, line_buf: &mut Vec<u8>, mut on_item: F) -> McResult<()>
where
    R: BufRead,
    F: FnMut(Item),
{
    loop {
        read_line(reader, line_buf)?;
        if line_buf.as_slice() == b"END" {
            return Ok(());
        }
        if !line_buf.starts_with(b"VALUE ") {
            return Err(error_from_line(line_buf));
        }
        let (key, flags, len, cas) = parse_value_header(&line_buf[6..])?;

        // The header's length is untrusted; grow with the data actually read.
        let want = len + CRLF.len();
        let mut value = Vec::with_capacity(want.min(INITIAL_VALUE_CAPACITY));
        (&mut *reader).take(want as u64).read_to_end(&mut value)?;
        if value.len() < want {
            return Err(McError::Network(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside a value block",
            )));
        }
        if !value.ends_with(CRLF) {
            return Err(McError::protocol("corrupt value block: missing CRLF"));
        }
        value.truncate(len);

        on_item(Item {
            key,
            value,
            flags,
            expiration: 0,
            cas,
        });
    }
}

/// Reads the status line of a storage or cas request.
pub fn read_storage_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<()> {
    read_line(reader, line_buf)?;
    match line_buf.as_slice() {
        b"STORED" => Ok(()),
        b"NOT_STORED" => Err(McError::NotStored),
        b"EXISTS" => Err(McError::CasConflict),
        b"NOT_FOUND" => Err(McError::CacheMiss),
        line => Err(error_from_line(line)),
    }
}

/// Reads the status line of a delete request.
pub fn read_delete_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<()> {
    read_line(reader, line_buf)?;
    match line_buf.as_slice() {
        b"DELETED" => Ok(()),
        b"NOT_FOUND" => Err(McError::CacheMiss),
        line => Err(error_from_line(line)),
    }
}

/// Reads the status line of a touch request.
pub fn read_touch_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<()> {
    read_line(reader, line_buf)?;
    match line_buf.as_slice() {
        b"TOUCHED" => Ok(()),
        b"NOT_FOUND" => Err(McError::CacheMiss),
        line => Err(error_from_line(line)),
    }
}

/// Reads the reply of `incr`/`decr`: the new counter value.
///
/// The server may right-pad a shrinking decrement result with spaces.
pub fn read_arith_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<u64> {
    read_line(reader, line_buf)?;
    let line = line_buf.as_slice();
    if line == b"NOT_FOUND" {
        return Err(McError::CacheMiss);
    }
    if line.starts_with(b"CLIENT_ERROR ") && contains(line, b"non-numeric") {
        return Err(McError::BadIncrDec);
    }
    if line.first().is_some_and(u8::is_ascii_digit) {
        let end = line
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |idx| idx + 1);
        return parse_u64(&line[..end]);
    }
    Err(error_from_line(line))
}

/// Reads an `OK` line, as sent after `flush_all`.
pub fn read_ok_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<()> {
    read_line(reader, line_buf)?;
    match line_buf.as_slice() {
        b"OK" => Ok(()),
        line => Err(error_from_line(line)),
    }
}

/// Reads a `VERSION <text>` line and returns the text.
pub fn read_version_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<String> {
    read_line(reader, line_buf)?;
    match line_buf.strip_prefix(b"VERSION ") {
        Some(version) => Ok(String::from_utf8_lossy(version).into_owned()),
        None => Err(error_from_line(line_buf)),
    }
}

/// Consumes reply lines up to and including a `VERSION` line.
///
/// Used after `noreply` writes: memcached still reports some failures for
/// them, and those lines sit in front of the `version` reply. Returns the
/// skipped lines.
pub fn skip_to_version<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> McResult<Vec<String>> {
    let mut skipped = Vec::new();
    loop {
        read_line(reader, line_buf)?;
        if line_buf.starts_with(b"VERSION ") {
            return Ok(skipped);
        }
        skipped.push(String::from_utf8_lossy(line_buf).into_owned());
    }
}

/// Maps a reply line that did not match the expected shape to an error.
///
/// `ERROR`, `CLIENT_ERROR <msg>` and `SERVER_ERROR <msg>` keep the server's
/// text; anything else is reported as an unexpected line.
pub fn error_from_line(line: &[u8]) -> McError {
    let text = String::from_utf8_lossy(line);
    if line == b"ERROR" || line.starts_with(b"CLIENT_ERROR") || line.starts_with(b"SERVER_ERROR") {
        McError::Protocol(text.into_owned())
    } else {
        McError::Protocol(format!("unexpected response line: {text:?}"))
    }
}

/// Reads one CRLF-terminated line into `buf`, without the terminator.
///
/// Lines longer than `MAX_LINE_LENGTH` are rejected.
pub fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> McResult<()> {
    buf.clear();
    let bytes = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(McError::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if !buf.ends_with(b"\n") && bytes == MAX_LINE_LENGTH {
        return Err(McError::protocol("response line exceeds length limit"));
    }
    if !buf.ends_with(CRLF) {
        return Err(McError::protocol("response line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - CRLF.len());
    Ok(())
}

fn parse_value_header(header: &[u8]) -> McResult<(String, u32, usize, Option<u64>)> {
    let mut fields = header.split(|&b| b == b' ');
    let (Some(key), Some(flags), Some(len)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(McError::protocol("truncated VALUE header"));
    };
    let cas = fields.next().map(parse_u64).transpose()?;
    if fields.next().is_some() {
        return Err(McError::protocol("too many fields in VALUE header"));
    }

    let key = std::str::from_utf8(key)
        .map_err(|_| McError::protocol("VALUE key is not valid UTF-8"))?
        .to_owned();
    let flags = u32::try_from(parse_u64(flags)?)
        .map_err(|_| McError::protocol("VALUE flags out of range"))?;
    let len = parse_u64(len)?;
    if len > MAX_VALUE_LENGTH as u64 {
        return Err(McError::protocol("VALUE length exceeds limit"));
    }
    Ok((key, flags, len as usize, cas))
}

fn parse_u64(data: &[u8]) -> McResult<u64> {
    if data.is_empty() {
        return Err(McError::protocol("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(McError::protocol("invalid number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| McError::protocol("number overflows u64"))?;
    }
    Ok(value)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn push_i64(out: &mut BytesMut, value: i64) {
    if value < 0 {
        out.put_u8(b'-');
    }
    push_u64(out, value.unsigned_abs());
}

fn push_u64(out: &mut BytesMut, mut value: u64) {
    // Digits go into a stack buffer first; no heap formatting on the hot path.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
