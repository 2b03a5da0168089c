//! One client per cache endpoint
//!
//! An [`EndpointClient`] owns a single persistent connection. A transport
//! failure fails the call in progress and drops the connection; the next
//! call dials again, retrying at a fixed interval up to the configured
//! number of attempts.
//!
//! Health bookkeeping lives here too: the connection manager pings each
//! client and the client flips between [`EndpointState::Live`] and
//! [`EndpointState::Degraded`] based on consecutive failures.

use crate::connection::RedisConnection;
use crate::protocol::CommandFrame;
use crate::script::Script;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, TryStreamExt};
use redis_mesh_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::EndpointState,
    value::RespValue,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Anything that can run a single command and return its reply
///
/// Implemented by [`EndpointClient`] for direct calls and by
/// [`BatchingPipeline`](crate::pipeline::BatchingPipeline) for batched ones.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` with `args`; server error replies map to
    /// [`RedisError::Server`]
    async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue>;
}

/// A client bound to one endpoint address
pub struct EndpointClient {
    uri: String,
    addr: String,
    config: ConnectionConfig,
    connection: Mutex<Option<RedisConnection>>,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("uri", &self.uri)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EndpointClient {
    /// Create a client without dialing; the first call connects
    pub fn new(uri: impl Into<String>, addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            uri: uri.into(),
            addr: addr.into(),
            config,
            connection: Mutex::new(None),
            state: AtomicU8::new(EndpointState::Live.as_u8()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Create a client and establish its connection immediately
    ///
    /// # Errors
    ///
    /// Fails when the endpoint cannot be reached within the retry budget.
    pub async fn connect(
        uri: impl Into<String>,
        addr: impl Into<String>,
        config: ConnectionConfig,
    ) -> RedisResult<Self> {
        let client = Self::new(uri, addr, config);
        drop(client.checkout(false).await?);
        info!("Connected to {} at {}", client.uri, client.addr);
        Ok(client)
    }

    /// Configured URI this client was created from
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Address the client dials (`host:port`)
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current routing state
    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the client is routable
    pub fn is_healthy(&self) -> bool {
        self.state() == EndpointState::Live
    }

    /// Consecutive failed health checks
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Run a single command
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Unavailable`] while the endpoint is degraded,
    /// [`RedisError::Shutdown`] once closed, and otherwise whatever the
    /// connection or server reports.
    pub async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        let mut guard = self.checkout(true).await?;
        let result = match guard.as_mut() {
            Some(conn) => conn.execute_command(command, &args).await,
            None => Err(self.missing_connection()),
        };
        self.settle(&mut guard, &result);
        result
    }

    /// Run several commands in one round trip
    ///
    /// Server errors stay in place as [`RespValue::Error`]; only transport
    /// failures fail the whole call.
    pub async fn execute_pipeline(&self, commands: &[CommandFrame]) -> RedisResult<Vec<RespValue>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.checkout(true).await?;
        let result = match guard.as_mut() {
            Some(conn) => conn.execute_pipeline(commands).await,
            None => Err(self.missing_connection()),
        };
        self.settle(&mut guard, &result);
        result
    }

    /// Get a string value
    pub async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        self.execute("GET", vec![key.into()])
            .await?
            .into_optional_string()
    }

    /// Set a string value, optionally expiring after `ttl`
    ///
    /// A TTL shorter than one millisecond means no expiry.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RedisResult<()> {
        let mut args: Vec<RespValue> = vec![key.into(), value.into()];
        if let Some(ttl) = ttl.filter(|t| t.as_millis() >= 1) {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            args.push("PX".into());
            args.push(millis.into());
        }
        self.execute("SET", args).await?;
        Ok(())
    }

    /// Delete a key, reporting whether it existed
    pub async fn delete(&self, key: &str) -> RedisResult<bool> {
        Ok(self.execute("DEL", vec![key.into()]).await?.as_int()? > 0)
    }

    /// Publish a payload on a channel, returning the receiver count
    pub async fn publish(&self, channel: &str, payload: Bytes) -> RedisResult<i64> {
        self.execute("PUBLISH", vec![channel.into(), payload.into()])
            .await?
            .as_int()
    }

    /// Run a script atomically on this endpoint
    pub async fn run_script(
        &self,
        script: &Script,
        keys: &[&str],
        args: Vec<RespValue>,
    ) -> RedisResult<RespValue> {
        script.execute(self, keys, args).await
    }

    /// Start a cursor scan over keys matching `pattern`
    ///
    /// Nothing is sent until the first page is requested. Scanning again
    /// restarts from the beginning.
    pub fn scan(self: &Arc<Self>, pattern: impl Into<String>, page_size: usize) -> KeyScan {
        KeyScan {
            client: Arc::clone(self),
            pattern: pattern.into(),
            page_size: page_size.max(1),
            cursor: 0,
            finished: false,
        }
    }

    /// Ping the endpoint, bounded by the ping timeout
    ///
    /// Pings bypass the degraded gate so a health check can observe
    /// recovery.
    pub async fn ping(&self) -> RedisResult<()> {
        let limit = self.config.ping_timeout;
        let mut guard = self.checkout(false).await?;
        let result = match guard.as_mut() {
            Some(conn) => conn.execute_with_timeout("PING", &[], limit).await,
            None => Err(self.missing_connection()),
        };
        self.settle(&mut guard, &result);
        match result? {
            RespValue::SimpleString(ref s) if s == "PONG" => Ok(()),
            other => Err(RedisError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Ping once and update the health bookkeeping
    ///
    /// After `failed_attempts` consecutive failures the client becomes
    /// [`EndpointState::Degraded`]; the next successful ping restores it.
    pub async fn check_health(&self, failed_attempts: u32) -> EndpointState {
        if self.state() == EndpointState::Closed {
            return EndpointState::Closed;
        }
        match self.ping().await {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                if self.transition(EndpointState::Degraded, EndpointState::Live) {
                    info!("Endpoint {} recovered", self.uri);
                }
            }
            Err(e) => {
                let failures = self.record_failure();
                warn!(
                    "Health check failed for {} ({} consecutive): {}",
                    self.uri, failures, e
                );
                if failures >= failed_attempts
                    && self.transition(EndpointState::Live, EndpointState::Degraded)
                {
                    warn!("Endpoint {} marked degraded", self.uri);
                }
            }
        }
        self.state()
    }

    /// Drop the current connection and dial again
    pub async fn reconnect(&self) -> RedisResult<()> {
        let mut guard = self.connection.lock().await;
        *guard = None;
        let conn = self.establish().await?;
        *guard = Some(conn);
        info!("Reconnected to {}", self.uri);
        Ok(())
    }

    /// Close the client; later calls fail with [`RedisError::Shutdown`]
    pub async fn close(&self) {
        self.state
            .store(EndpointState::Closed.as_u8(), Ordering::Release);
        self.connection.lock().await.take();
        debug!("Closed endpoint client for {}", self.uri);
    }

    /// Open a dedicated connection outside the shared one, for subscribers
    pub(crate) async fn open_dedicated(&self) -> RedisResult<RedisConnection> {
        self.ensure_routable()?;
        self.establish().await
    }

    fn transition(&self, from: EndpointState, to: EndpointState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn record_failure(&self) -> u32 {
        let previous = self
            .consecutive_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }

    fn ensure_routable(&self) -> RedisResult<()> {
        match self.state() {
            EndpointState::Live => Ok(()),
            EndpointState::Degraded => Err(RedisError::Unavailable(self.uri.clone())),
            EndpointState::Closed => Err(RedisError::Shutdown(self.uri.clone())),
        }
    }

    fn missing_connection(&self) -> RedisError {
        RedisError::Connection(format!("No connection to {}", self.addr))
    }

    async fn checkout(&self, gated: bool) -> RedisResult<MutexGuard<'_, Option<RedisConnection>>> {
        if gated {
            self.ensure_routable()?;
        } else if self.state() == EndpointState::Closed {
            return Err(RedisError::Shutdown(self.uri.clone()));
        }

        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(RedisConnection::is_desynced) {
            warn!("Discarding connection to {} after an abandoned call", self.addr);
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.establish().await?);
        }
        Ok(guard)
    }

    fn settle<T>(&self, slot: &mut Option<RedisConnection>, result: &RedisResult<T>) {
        if let Err(e) = result {
            if e.is_transport() {
                warn!("Dropping connection to {}: {}", self.addr, e);
                *slot = None;
            }
        }
    }

    async fn establish(&self) -> RedisResult<RedisConnection> {
        let attempts = self.config.retry_attempts as usize;
        let mut attempt = 0;
        loop {
            match RedisConnection::connect(&self.addr, self.config.clone()).await {
                Ok(conn) => {
                    if attempt > 0 {
                        info!("Connected to {} after {} retries", self.addr, attempt);
                    }
                    return Ok(conn);
                }
                Err(e) if e.is_transport() => {
                    if attempt >= attempts {
                        warn!("Giving up on {} after {} retries: {}", self.addr, attempt, e);
                        return Err(RedisError::MaxRetriesExceeded(attempts));
                    }
                    attempt += 1;
                    debug!("Connect to {} failed ({}), retry {}/{}", self.addr, e, attempt, attempts);
                    tokio::time::sleep(self.config.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl CommandRunner for EndpointClient {
    async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        EndpointClient::execute(self, command, args).await
    }
}

/// A lazy cursor scan over one endpoint
///
/// Keys may repeat across pages, as the server only guarantees that keys
/// present for the whole scan are returned at least once.
#[derive(Debug)]
pub struct KeyScan {
    client: Arc<EndpointClient>,
    pattern: String,
    page_size: usize,
    cursor: u64,
    finished: bool,
}

impl KeyScan {
    /// Fetch the next page, or `None` once the cursor has wrapped
    pub async fn next_page(&mut self) -> RedisResult<Option<Vec<String>>> {
        if self.finished {
            return Ok(None);
        }

        let reply = self
            .client
            .execute(
                "SCAN",
                vec![
                    self.cursor.to_string().into(),
                    "MATCH".into(),
                    self.pattern.as_str().into(),
                    "COUNT".into(),
                    (self.page_size as i64).into(),
                ],
            )
            .await?;

        let mut parts = reply.into_array()?.into_iter();
        let (Some(cursor), Some(keys)) = (parts.next(), parts.next()) else {
            return Err(RedisError::UnexpectedResponse(
                "SCAN reply must hold a cursor and a key list".to_string(),
            ));
        };
        let cursor = cursor
            .as_string()?
            .parse::<u64>()
            .map_err(|e| RedisError::UnexpectedResponse(format!("Invalid SCAN cursor: {e}")))?;
        let keys = keys
            .into_array()?
            .iter()
            .map(RespValue::as_string)
            .collect::<RedisResult<Vec<_>>>()?;

        self.cursor = cursor;
        self.finished = cursor == 0;
        Ok(Some(keys))
    }

    /// Drain every page into a de-duplicated list
    pub async fn collect_all(mut self) -> RedisResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        while let Some(page) = self.next_page().await? {
            for key in page {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// View the scan as a stream of keys
    pub fn into_stream(self) -> impl Stream<Item = RedisResult<String>> + Send {
        stream::try_unfold(self, |mut scan| async move {
            let page = scan.next_page().await?;
            Ok::<_, RedisError>(page.map(|keys| {
                (stream::iter(keys.into_iter().map(Ok::<String, RedisError>)), scan)
            }))
        })
        .try_flatten()
    }
}
