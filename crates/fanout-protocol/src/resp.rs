//! RESP2 (Redis serialization protocol) codec.
//!
//! Only what the gateway needs to drive a pub/sub connection: command
//! encoding (arrays of bulk strings) and incremental reply decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ProtocolError;

/// Maximum accepted bulk string length (512 MiB, the Redis limit).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$n` followed by n bytes; `None` for the null bulk string.
    Bulk(Option<Bytes>),
    /// `*n` followed by n values; `None` for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Borrow the bytes of a simple or bulk string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(s) => Some(s.as_bytes()),
            RespValue::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Take the bytes of a simple or bulk string.
    #[must_use]
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            RespValue::Simple(s) => Some(Bytes::from(s)),
            RespValue::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

/// Encode a command as an array of bulk strings.
#[must_use]
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.put_u8(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for arg in args {
        buf.put_u8(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.extend_from_slice(CRLF);
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
    buf.freeze()
}

/// Try to decode one value from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if the buffer holds bytes that are not valid RESP.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<RespValue>, ProtocolError> {
    match parse_value(buf, 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let end = rest.windows(2).position(|w| w == CRLF)?;
    Some((&rest[..end], start + end + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::Invalid(format!(
                "bad RESP integer: {}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_value(buf: &[u8], start: usize) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let Some(&tag) = buf.get(start) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, start + 1) else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    max: MAX_BULK_LEN,
                });
            }
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != CRLF {
                return Err(ProtocolError::Invalid("bulk string not CRLF terminated".into()));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((RespValue::Bulk(Some(data)), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let mut items = Vec::with_capacity((len as usize).min(64));
            let mut pos = next;
            for _ in 0..len {
                match parse_value(buf, pos)? {
                    Some((item, after)) => {
                        items.push(item);
                        pos = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), pos)))
        }
        other => Err(ProtocolError::Invalid(format!(
            "unknown RESP type byte 0x{:02x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let cmd = encode_command(&[b"SUBSCRIBE", b"metrics:dashboard"]);
        assert_eq!(&cmd[..], b"*2\r\n$9\r\nSUBSCRIBE\r\n$17\r\nmetrics:dashboard\r\n");
    }

    #[test]
    fn test_decode_message_push() {
        let mut buf = BytesMut::from(&b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$5\r\nhello\r\n"[..]);
        let value = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(Some(vec![
                RespValue::Bulk(Some(Bytes::from_static(b"message"))),
                RespValue::Bulk(Some(Bytes::from_static(b"chan"))),
                RespValue::Bulk(Some(Bytes::from_static(b"hello"))),
            ]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_keeps_buffer() {
        let full = b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n";
        for cut in 1..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode_from(&mut buf).unwrap(), None, "cut at {}", cut);
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_decode_scalars_and_pipelined_values() {
        let mut buf = BytesMut::from(&b"+OK\r\n-ERR wrong\r\n:7\r\n$-1\r\n*-1\r\n"[..]);
        assert_eq!(decode_from(&mut buf).unwrap(), Some(RespValue::Simple("OK".into())));
        assert_eq!(
            decode_from(&mut buf).unwrap(),
            Some(RespValue::Error("ERR wrong".into()))
        );
        assert_eq!(decode_from(&mut buf).unwrap(), Some(RespValue::Integer(7)));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(RespValue::Bulk(None)));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(RespValue::Array(None)));
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_binary_safe_bulk() {
        let mut buf = BytesMut::from(&b"$4\r\na\r\nb\r\n"[..]);
        let value = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(value.as_bytes(), Some(&b"a\r\nb"[..]));
    }

    #[test]
    fn test_decode_invalid_type_byte() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::Invalid(_))
        ));
    }
}
