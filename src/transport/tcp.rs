//! RESP2 over TCP

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{resp, Connection, Connector};
use crate::cluster::{Command, Endpoint, Reply};
use crate::error::{Error, Result};

/// Connector for real store nodes
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    socket_timeout: Duration,
    password: Option<String>,
    database: u32,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, socket_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            socket_timeout,
            password: None,
            database: 0,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// Logical database, only meaningful outside cluster mode
    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| Error::connection(endpoint, "connect timed out"))?
        .map_err(|e| Error::connection(endpoint, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connection(endpoint, e))?;

        let mut conn = TcpConnection {
            endpoint: endpoint.clone(),
            stream: BufStream::new(stream),
            buffer: BytesMut::with_capacity(4096),
            socket_timeout: self.socket_timeout,
            broken: false,
        };

        if let Some(password) = &self.password {
            conn.execute(&Command::auth(password)).await?;
        }
        if self.database != 0 {
            conn.execute(&Command::select(self.database)).await?;
        }

        debug!("Connected to {}", endpoint);
        Ok(Box::new(conn))
    }
}

/// A single TCP connection
pub struct TcpConnection {
    endpoint: Endpoint,
    stream: BufStream<TcpStream>,
    buffer: BytesMut,
    socket_timeout: Duration,
    broken: bool,
}

impl TcpConnection {
    async fn round_trip(&mut self, command: &Command) -> Result<Reply> {
        let mut out = BytesMut::new();
        resp::encode_command(command.parts(), &mut out);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;

        loop {
            if let Some((reply, used)) = resp::parse_reply(&self.buffer)? {
                let _ = self.buffer.split_to(used);
                return Ok(reply);
            }
            let read = self.stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::connection(&self.endpoint, "connection closed by peer"));
            }
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, command: &Command) -> Result<Reply> {
        if self.broken {
            return Err(Error::connection(&self.endpoint, "connection is broken"));
        }
        let deadline = self.socket_timeout;
        let result = match timeout(deadline, self.round_trip(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        };
        // Any transport failure leaves unread bytes in flight
        if let Err(e) = &result {
            if e.is_connection_failure() || matches!(e, Error::Protocol(_)) {
                self.broken = true;
            }
        }
        result
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
