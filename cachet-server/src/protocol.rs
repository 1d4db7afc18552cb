//! # RESP2 Framing
//!
//! Purpose: Parse incoming command frames and encode replies for the
//! embedded store's sessions.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `decode` returns `Ok(None)` until a whole frame
//!    is buffered and consumes nothing in that case.
//! 2. **Buffer Reuse**: Replies append to a caller-provided buffer.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// RESP2 framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A line was not terminated by CRLF.
    #[error("invalid line terminator")]
    InvalidLine,
    /// Frame started with a byte that is not a RESP2 type marker.
    #[error("unknown type prefix {0:#04x}")]
    UnknownPrefix(u8),
    /// Length or integer field was not a valid decimal.
    #[error("invalid integer field")]
    InvalidInteger,
    /// Bulk payload was not followed by CRLF.
    #[error("bulk string missing CRLF")]
    MissingCrlf,
    /// Expected an array of bulk strings (a command).
    #[error("expected command array")]
    ExpectedCommand,
}

/// A RESP2 frame: a parsed request or a reply about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays; a null array decodes as empty.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// `+OK`.
    pub fn ok() -> Self {
        RespValue::Simple(b"OK".to_vec())
    }

    /// Builds an error reply from a code (`ERR`, `WRONGTYPE`) and message.
    pub fn error(code: &str, message: &str) -> Self {
        let mut text = Vec::with_capacity(code.len() + message.len() + 1);
        text.extend_from_slice(code.as_bytes());
        text.push(b' ');
        text.extend_from_slice(message.as_bytes());
        RespValue::Error(text)
    }

    /// Builds a non-null bulk reply.
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        RespValue::Bulk(Some(data.into()))
    }

    /// Builds an array of bulk strings.
    pub fn bulk_array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        RespValue::Array(items.into_iter().map(RespValue::bulk).collect())
    }

    /// Appends the wire form of this value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(value) => {
                out.push(b':');
                push_i64(out, *value);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Bulk(Some(data)) => {
                out.push(b'$');
                push_i64(out, data.len() as i64);
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Array(items) => {
                out.push(b'*');
                push_i64(out, items.len() as i64);
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

/// Decodes one RESP value from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is incomplete.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
    let mut pos = 0;
    match parse_value(&buf[..], &mut pos)? {
        Some(value) => {
            buf.advance(pos);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Decodes one command (an array of bulk strings) from the front of `buf`.
pub fn decode_command(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
    let value = match decode(buf)? {
        Some(value) => value,
        None => return Ok(None),
    };

    match value {
        RespValue::Array(items) => {
            let mut args = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    RespValue::Bulk(Some(data)) => args.push(data),
                    _ => return Err(ProtocolError::ExpectedCommand),
                }
            }
            Ok(Some(args))
        }
        _ => Err(ProtocolError::ExpectedCommand),
    }
}

fn parse_value(data: &[u8], pos: &mut usize) -> Result<Option<RespValue>, ProtocolError> {
    let line = match read_line(data, pos)? {
        Some(line) => line,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ProtocolError::InvalidLine);
    }

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some(RespValue::Simple(body.to_vec()))),
        b'-' => Ok(Some(RespValue::Error(body.to_vec()))),
        b':' => Ok(Some(RespValue::Integer(parse_i64(body)?))),
        b'$' => {
            let len = parse_i64(body)?;
            if len < 0 {
                return Ok(Some(RespValue::Bulk(None)));
            }
            let len = len as usize;
            let end = *pos + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(ProtocolError::MissingCrlf);
            }
            let payload = data[*pos..end].to_vec();
            *pos = end + 2;
            Ok(Some(RespValue::Bulk(Some(payload))))
        }
        b'*' => {
            let len = parse_i64(body)?;
            if len <= 0 {
                return Ok(Some(RespValue::Array(Vec::new())));
            }
            // Cap the pre-allocation; the length prefix is untrusted.
            let mut items = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                match parse_value(data, pos)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            Ok(Some(RespValue::Array(items)))
        }
        other => Err(ProtocolError::UnknownPrefix(other)),
    }
}

fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, ProtocolError> {
    let start = *pos;
    let newline = match data[start..].iter().position(|&b| b == b'\n') {
        Some(offset) => start + offset,
        None => return Ok(None),
    };
    if newline == start || data[newline - 1] != b'\r' {
        return Err(ProtocolError::InvalidLine);
    }
    *pos = newline + 1;
    Ok(Some(&data[start..newline - 1]))
}

fn parse_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(ProtocolError::InvalidInteger)?;
    }

    Ok(if negative { -value } else { value })
}

fn push_i64(out: &mut Vec<u8>, value: i64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        buf[0] = b'0';
        len = 1;
    }
    while magnitude > 0 {
        buf[len] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        len += 1;
    }
    if value < 0 {
        out.push(b'-');
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn encodes_negative_integer() {
        let mut buf = Vec::new();
        RespValue::Integer(-2).encode(&mut buf);
        assert_eq!(&buf, b":-2\r\n");
    }

    #[test]
    fn parses_simple_string() {
        let mut buf = buffer(b"+OK\r\n");
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::ok()));
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_bulk_and_null_bulk() {
        let mut buf = buffer(b"$5\r\nhello\r\n$-1\r\n");
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::bulk(&b"hello"[..])));
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Bulk(None)));
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_error_and_integer() {
        let mut buf = buffer(b"-ERR bad\r\n:42\r\n");
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Error(b"ERR bad".to_vec())));
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Integer(42)));
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let mut buf = buffer(b"*2\r\n$3\r\nfoo\r\n$3\r\nba");
        assert_eq!(decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 19);

        buf.extend_from_slice(b"r\r\n");
        let value = decode(&mut buf).unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_array(["foo", "bar"]));
        assert!(buf.is_empty());
    }

    #[test]
    fn nested_array_round_trips_through_encoder() {
        let value = RespValue::Array(vec![
            RespValue::bulk(&b"message"[..]),
            RespValue::Integer(3),
            RespValue::Array(vec![RespValue::Bulk(None)]),
        ]);
        let mut out = Vec::new();
        value.encode(&mut out);
        let mut buf = buffer(&out);
        assert_eq!(decode(&mut buf).unwrap(), Some(value));
    }

    #[test]
    fn decodes_client_encoded_command() {
        let packed = redis::cmd("SET").arg("k").arg("v").get_packed_command();
        let mut buf = buffer(&packed);
        let args = decode_command(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
    }

    #[test]
    fn rejects_bad_framing() {
        let mut buf = buffer(b"?what\r\n");
        assert_eq!(decode(&mut buf), Err(ProtocolError::UnknownPrefix(b'?')));

        let mut buf = buffer(b"$3\r\nabcXY");
        assert_eq!(decode(&mut buf), Err(ProtocolError::MissingCrlf));

        let mut buf = buffer(b":12a\r\n");
        assert_eq!(decode(&mut buf), Err(ProtocolError::InvalidInteger));

        let mut buf = buffer(b"+OK\n");
        assert_eq!(decode(&mut buf), Err(ProtocolError::InvalidLine));
    }

    #[test]
    fn command_must_be_bulk_array() {
        let mut buf = buffer(b"+PING\r\n");
        assert_eq!(decode_command(&mut buf), Err(ProtocolError::ExpectedCommand));
    }
}
