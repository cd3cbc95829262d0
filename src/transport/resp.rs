//! RESP2 framing.
//!
//! Commands are always sent as arrays of bulk strings. Replies are parsed
//! incrementally from a receive buffer: [`parse_reply`] returns `Ok(None)`
//! until a complete frame is available.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cluster::Reply;
use crate::error::{Error, Result};

/// Append the wire form of a command to `out`
pub fn encode_command(parts: &[Bytes], out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(parts.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for part in parts {
        out.put_u8(b'$');
        out.put_slice(part.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
        out.put_slice(part);
        out.put_slice(b"\r\n");
    }
}

/// Try to parse one reply from the front of `buf`.
///
/// On success returns the reply together with the number of bytes consumed.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    parse_at(buf, 0)
}

fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = &buf[pos + 1..line_end];
    let next = line_end + 2;

    match prefix {
        b'+' => Ok(Some((Reply::Status(utf8(line)), next))),
        b'-' => Ok(Some((Reply::Error(utf8(line)), next))),
        b':' => Ok(Some((Reply::Int(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((Reply::Bulk(data), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Nil, next)));
            }
            let mut items = Vec::with_capacity(count.min(1024) as usize);
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), cursor)))
        }
        other => Err(Error::Protocol(format!(
            "unknown reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid integer '{}'", utf8(line))))
}

fn utf8(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let mut out = BytesMut::new();
        encode_command(
            &[Bytes::from_static(b"GET"), Bytes::from_static(b"key")],
            &mut out,
        );
        assert_eq!(&out[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn test_parse_simple_types() {
        assert_eq!(
            parse_reply(b"+OK\r\n").unwrap(),
            Some((Reply::Status("OK".into()), 5))
        );
        assert_eq!(
            parse_reply(b"-ERR bad\r\n").unwrap(),
            Some((Reply::Error("ERR bad".into()), 10))
        );
        assert_eq!(parse_reply(b":-12\r\n").unwrap(), Some((Reply::Int(-12), 6)));
        assert_eq!(parse_reply(b"$-1\r\n").unwrap(), Some((Reply::Nil, 5)));
        assert_eq!(
            parse_reply(b"$5\r\nhello\r\n").unwrap(),
            Some((Reply::Bulk(Bytes::from_static(b"hello")), 11))
        );
    }

    #[test]
    fn test_parse_binary_bulk() {
        let frame = b"$4\r\n\r\n\x00\x01\r\n";
        let (reply, used) = parse_reply(frame).unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"\r\n\x00\x01")));
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_parse_nested_array() {
        let frame = b"*2\r\n*2\r\n:0\r\n:5460\r\n$3\r\nfoo\r\n";
        let (reply, used) = parse_reply(frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::Array(vec![Reply::Int(0), Reply::Int(5460)]),
                Reply::Bulk(Bytes::from_static(b"foo")),
            ])
        );
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        assert_eq!(parse_reply(b"").unwrap(), None);
        assert_eq!(parse_reply(b"+OK").unwrap(), None);
        assert_eq!(parse_reply(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse_reply(b"*2\r\n:1\r\n").unwrap(), None);
    }

    #[test]
    fn test_protocol_errors() {
        assert!(parse_reply(b"?what\r\n").is_err());
        assert!(parse_reply(b":abc\r\n").is_err());
        assert!(parse_reply(b"$3\r\nabcXY").is_err());
    }
}
