//! Low-level TCP connections to a cache endpoint
//!
//! A [`RedisConnection`] owns one socket and a read buffer. It knows how to
//! authenticate, select a database, run a single command, and run a batch
//! of commands in one write. Reconnection policy lives one layer up in
//! [`crate::endpoint::EndpointClient`].

use crate::protocol::{CommandFrame, RespDecoder, RespEncoder};
use bytes::{Buf, BytesMut};
use redis_mesh_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A connection to one cache endpoint
pub struct RedisConnection {
    stream: TcpStream,
    read_buffer: BytesMut,
    config: ConnectionConfig,
    addr: String,
    in_flight: bool,
}

impl RedisConnection {
    /// Connect to `addr` (`host:port`), authenticate and select the database
    pub async fn connect(addr: &str, config: ConnectionConfig) -> RedisResult<Self> {
        debug!("Connecting to {}", addr);

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        if let Some(keepalive_duration) = config.tcp_keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            socket2::SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| {
                    RedisError::Connection(format!("Failed to set TCP keepalive: {}", e))
                })?;
        }

        let mut conn = Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            config,
            addr: addr.to_string(),
            in_flight: false,
        };

        if let Some(password) = conn.config.password.clone() {
            conn.authenticate(&password).await?;
        }
        if conn.config.database != 0 {
            let db = i64::from(conn.config.database);
            conn.execute_command("SELECT", &[RespValue::from(db)])
                .await?;
        }

        Ok(conn)
    }

    /// Address this connection was dialed with
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn authenticate(&mut self, password: &str) -> RedisResult<()> {
        debug!("Authenticating with {}", self.addr);
        match self
            .execute_command("AUTH", &[RespValue::from(password)])
            .await
        {
            Ok(RespValue::SimpleString(ref s)) if s == "OK" => Ok(()),
            Ok(other) => Err(RedisError::Auth(format!(
                "Unexpected authentication response: {:?}",
                other
            ))),
            Err(RedisError::Server(msg)) => Err(RedisError::Auth(msg)),
            Err(e) => Err(e),
        }
    }

    /// Whether a previous call was abandoned between write and reply
    ///
    /// Such a connection may still receive the abandoned reply, so it must
    /// not be reused.
    pub fn is_desynced(&self) -> bool {
        self.in_flight
    }

    /// Execute a command and return its reply
    ///
    /// Error replies are turned into [`RedisError::Server`].
    pub async fn execute_command(
        &mut self,
        command: &str,
        args: &[RespValue],
    ) -> RedisResult<RespValue> {
        let limit = self.config.operation_timeout;
        self.execute_with_timeout(command, args, limit).await
    }

    /// Execute a command, bounding the write and the read by `limit`
    pub async fn execute_with_timeout(
        &mut self,
        command: &str,
        args: &[RespValue],
        limit: Duration,
    ) -> RedisResult<RespValue> {
        let encoded = RespEncoder::encode_command(command, args);
        self.in_flight = true;
        self.write_all(&encoded, limit).await?;
        let reply = self.read_reply(limit).await?;
        self.in_flight = false;
        reply.into_result()
    }

    /// Write a batch of commands in one write and read every reply
    ///
    /// Error replies are returned in place so each caller can observe its
    /// own command's status.
    pub async fn execute_pipeline(
        &mut self,
        commands: &[CommandFrame],
    ) -> RedisResult<Vec<RespValue>> {
        let limit = self.config.operation_timeout;
        let encoded = RespEncoder::encode_pipeline(commands);
        self.in_flight = true;
        self.write_all(&encoded, limit).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply(limit).await?);
        }
        self.in_flight = false;
        Ok(replies)
    }

    /// Send a command without waiting for a reply (subscriber connections)
    pub async fn send(&mut self, command: &str, args: &[RespValue]) -> RedisResult<()> {
        let limit = self.config.operation_timeout;
        let encoded = RespEncoder::encode_command(command, args);
        self.write_all(&encoded, limit).await
    }

    /// Wait for the next frame pushed by the server, without a timeout
    pub async fn read_push(&mut self) -> RedisResult<RespValue> {
        self.read_frame().await
    }

    async fn write_all(&mut self, data: &[u8], limit: Duration) -> RedisResult<()> {
        timeout(limit, self.stream.write_all(data))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(RedisError::Io)
    }

    async fn read_reply(&mut self, limit: Duration) -> RedisResult<RespValue> {
        timeout(limit, self.read_frame())
            .await
            .map_err(|_| RedisError::Timeout)?
    }

    async fn read_frame(&mut self) -> RedisResult<RespValue> {
        loop {
            let mut cursor = Cursor::new(&self.read_buffer[..]);
            if let Some(value) = RespDecoder::decode(&mut cursor)? {
                let consumed = cursor.position() as usize;
                self.read_buffer.advance(consumed);
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(RedisError::Connection(format!(
                    "Connection to {} closed by server",
                    self.addr
                )));
            }
        }
    }
}
