//! Node addresses

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Host and port of a store node.
///
/// Nodes are identified by their `host:port` string everywhere in the client:
/// pool registry keys, redirection targets and topology replies all agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registry key (`host:port`)
    pub fn node_key(&self) -> String {
        self.to_string()
    }

    /// Parse a comma separated list such as `10.0.0.1:7000,10.0.0.2:7000`
    pub fn parse_list(list: &str) -> Result<Vec<Endpoint>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Endpoint::from_str)
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("endpoint '{}' is not host:port", s)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("endpoint '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("endpoint '{}' has invalid port: {}", s, e)))?;
        Ok(Endpoint::new(host, port))
    }
}
