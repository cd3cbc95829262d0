//! Commands and replies exchanged with store nodes

use std::fmt;

use bytes::Bytes;

use crate::cluster::Endpoint;
use crate::error::{Error, Result};

/// A single store command.
///
/// `parts[0]` is the verb and `parts[1..=key_count]` are the routing keys;
/// everything after is plain arguments. Keys must be added before arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    parts: Vec<Bytes>,
    key_count: usize,
    readonly: bool,
}

impl Command {
    pub fn new(verb: &'static str) -> Self {
        Self {
            parts: vec![Bytes::from_static(verb.as_bytes())],
            key_count: 0,
            readonly: false,
        }
    }

    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        debug_assert_eq!(self.parts.len(), self.key_count + 1, "keys precede arguments");
        self.parts.push(Bytes::copy_from_slice(key.as_ref()));
        self.key_count += 1;
        self
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Mark as eligible for replica reads
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn verb(&self) -> &str {
        std::str::from_utf8(&self.parts[0]).unwrap_or("?")
    }

    pub fn keys(&self) -> &[Bytes] {
        &self.parts[1..=self.key_count]
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    pub fn ping() -> Self {
        Command::new("PING")
    }

    pub fn asking() -> Self {
        Command::new("ASKING")
    }

    pub fn readonly_mode() -> Self {
        Command::new("READONLY")
    }

    pub fn cluster_slots() -> Self {
        Command::new("CLUSTER").arg("SLOTS")
    }

    pub fn auth(password: &str) -> Self {
        Command::new("AUTH").arg(password)
    }

    pub fn select(database: u32) -> Self {
        Command::new("SELECT").arg(database.to_string())
    }

    pub fn sentinel_master_addr(master_name: &str) -> Self {
        Command::new("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
    }

    pub fn get(key: &[u8]) -> Self {
        Command::new("GET").key(key).readonly()
    }

    pub fn set(key: &[u8], value: &[u8]) -> Self {
        Command::new("SET").key(key).arg(value)
    }

    pub fn setex(key: &[u8], seconds: u64, value: &[u8]) -> Self {
        Command::new("SETEX")
            .key(key)
            .arg(seconds.to_string())
            .arg(value)
    }

    pub fn del(key: &[u8]) -> Self {
        Command::new("DEL").key(key)
    }

    pub fn del_many<K: AsRef<[u8]>>(keys: &[K]) -> Self {
        keys.iter().fold(Command::new("DEL"), |cmd, k| cmd.key(k))
    }

    pub fn incr(key: &[u8]) -> Self {
        Command::new("INCR").key(key)
    }

    pub fn decr(key: &[u8]) -> Self {
        Command::new("DECR").key(key)
    }

    pub fn expire(key: &[u8], seconds: u64) -> Self {
        Command::new("EXPIRE").key(key).arg(seconds.to_string())
    }

    pub fn hget(key: &[u8], field: &[u8]) -> Self {
        Command::new("HGET").key(key).arg(field).readonly()
    }

    pub fn hset(key: &[u8], field: &[u8], value: &[u8]) -> Self {
        Command::new("HSET").key(key).arg(field).arg(value)
    }

    pub fn hdel(key: &[u8], field: &[u8]) -> Self {
        Command::new("HDEL").key(key).arg(field)
    }

    pub fn hgetall(key: &[u8]) -> Self {
        Command::new("HGETALL").key(key).readonly()
    }

    pub fn zadd(key: &[u8], score: f64, member: &[u8]) -> Self {
        Command::new("ZADD")
            .key(key)
            .arg(format_score(score))
            .arg(member)
    }

    pub fn zrange(key: &[u8], start: i64, stop: i64) -> Self {
        Command::new("ZRANGE")
            .key(key)
            .arg(start.to_string())
            .arg(stop.to_string())
            .readonly()
    }

    pub fn zrange_by_score(key: &[u8], min: f64, max: f64) -> Self {
        Command::new("ZRANGEBYSCORE")
            .key(key)
            .arg(format_score(min))
            .arg(format_score(max))
            .readonly()
    }

    pub fn zrem(key: &[u8], member: &[u8]) -> Self {
        Command::new("ZREM").key(key).arg(member)
    }

    pub fn zcard(key: &[u8]) -> Self {
        Command::new("ZCARD").key(key).readonly()
    }
}

fn format_score(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb())?;
        for key in self.keys() {
            write!(f, " {}", String::from_utf8_lossy(key))?;
        }
        Ok(())
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Decoded server reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Status(String),
    Int(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    Error(String),
}

impl Reply {
    /// Turn error replies into errors, recognizing redirections
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(parse_error_reply(&msg)),
            other => Ok(other),
        }
    }

    pub fn into_bytes(self) -> Result<Option<Bytes>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(b) => Ok(Some(b)),
            Reply::Status(s) => Ok(Some(Bytes::from(s))),
            other => Err(other.unexpected("bulk")),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Bulk(b) => std::str::from_utf8(&b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::UnexpectedReply {
                    command: "integer".into(),
                    reply: String::from_utf8_lossy(&b).into_owned(),
                }),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(other.unexpected("array")),
        }
    }

    pub fn into_bytes_vec(self) -> Result<Vec<Bytes>> {
        self.into_array()?
            .into_iter()
            .filter_map(|r| r.into_bytes().transpose())
            .collect()
    }

    pub fn is_ok_status(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("OK") || s.eq_ignore_ascii_case("PONG"))
    }

    fn unexpected(&self, wanted: &str) -> Error {
        Error::UnexpectedReply {
            command: wanted.to_string(),
            reply: format!("{:?}", self),
        }
    }
}

/// Classify an error reply.
///
/// `MOVED <slot> <host:port>` and `ASK <slot> <host:port>` become redirections,
/// anything else is a plain server error.
pub fn parse_error_reply(msg: &str) -> Error {
    let mut parts = msg.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    if kind != "MOVED" && kind != "ASK" {
        return Error::Server(msg.to_string());
    }

    let slot = parts.next().and_then(|s| s.parse::<u16>().ok());
    let endpoint = parts.next().and_then(|s| s.parse::<Endpoint>().ok());
    match (kind, slot, endpoint) {
        ("MOVED", Some(slot), Some(endpoint)) => Error::Moved { slot, endpoint },
        ("ASK", Some(slot), Some(endpoint)) => Error::Ask { slot, endpoint },
        _ => Error::UnknownRedirection(msg.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_builder_layout() {
        let cmd = Command::setex(b"k", 30, b"v");
        assert_eq!(cmd.verb(), "SETEX");
        assert_eq!(cmd.keys(), &[Bytes::from_static(b"k")]);
        assert_eq!(cmd.parts().len(), 4);
        assert!(!cmd.is_readonly());
        assert!(Command::get(b"k").is_readonly());
        assert!(Command::ping().keys().is_empty());
    }

    #[test]
    fn test_del_many_keys() {
        let cmd = Command::del_many(&["a", "b", "c"]);
        assert_eq!(cmd.keys().len(), 3);
        assert_eq!(cmd.to_string(), "DEL a b c");
    }

    #[test]
    fn test_score_format() {
        let cmd = Command::zrange_by_score(b"z", 1462060800000.0, f64::INFINITY);
        assert_eq!(cmd.parts()[2], Bytes::from_static(b"1462060800000"));
        assert_eq!(cmd.parts()[3], Bytes::from_static(b"+inf"));
    }

    #[test]
    fn test_parse_redirections() {
        assert_matches!(
            parse_error_reply("MOVED 3999 127.0.0.1:6381"),
            Error::Moved { slot: 3999, endpoint } if endpoint == Endpoint::new("127.0.0.1", 6381)
        );
        assert_matches!(
            parse_error_reply("ASK 12 10.0.0.3:7002"),
            Error::Ask { slot: 12, .. }
        );
        assert_matches!(
            parse_error_reply("MOVED nonsense"),
            Error::UnknownRedirection(_)
        );
        assert_matches!(
            parse_error_reply("WRONGTYPE Operation against a key"),
            Error::Server(_)
        );
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Nil.into_bytes().unwrap(), None);
        assert_eq!(Reply::Int(7).into_int().unwrap(), 7);
        assert_eq!(Reply::Bulk(Bytes::from_static(b"42")).into_int().unwrap(), 42);
        assert!(Reply::Array(vec![]).into_int().is_err());

        let arr = Reply::Array(vec![
            Reply::Bulk(Bytes::from_static(b"a")),
            Reply::Nil,
            Reply::Bulk(Bytes::from_static(b"b")),
        ]);
        assert_eq!(arr.into_bytes_vec().unwrap().len(), 2);
    }
}
