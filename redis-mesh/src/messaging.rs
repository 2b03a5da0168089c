//! Node-to-node messages over pub/sub
//!
//! Each node listens on `<cluster>:messaging:<address>`. A subscriber
//! listens on every healthy messaging endpoint and keeps that set current:
//! on every health-check tick it subscribes on endpoints that recovered or
//! appeared after a DNS change and replaces connections that failed.
//!
//! A sender starts at the endpoint the channel hashes to. An endpoint that
//! reports no receiver is skipped for the next one, since the subscriber
//! may not have reached it yet; failures count against
//! `message_send_attempts`.

use crate::connection::RedisConnection;
use crate::endpoint::EndpointClient;
use crate::pool::EndpointPool;
use crate::sharded_map::shard_index;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use redis_mesh_core::{
    config::ClusterConfig,
    error::{RedisError, RedisResult},
    types::NodeAddress,
    value::RespValue,
};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Payloads delivered to a subscribed node
///
/// An error item reports a lost endpoint connection. The stream keeps
/// going and the endpoint is subscribed again on the next resync.
pub type MessageStream = Pin<Box<dyn Stream<Item = RedisResult<Bytes>> + Send>>;

type Inbox = mpsc::UnboundedSender<RedisResult<Bytes>>;

/// Pub/sub channel for messages addressed to `node`
pub fn messaging_channel(cluster: &str, node: &NodeAddress) -> String {
    format!("{cluster}:messaging:{node}")
}

/// Sends and receives node messages through the messaging pool
pub struct Messenger {
    pool: Arc<EndpointPool>,
    cluster: String,
    send_attempts: usize,
    confirm_timeout: Duration,
    resync_interval: Duration,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("cluster", &self.cluster)
            .field("send_attempts", &self.send_attempts)
            .finish_non_exhaustive()
    }
}

impl Messenger {
    /// Create a messenger over the messaging pool
    pub fn new(pool: Arc<EndpointPool>, config: &ClusterConfig) -> Self {
        Self {
            pool,
            cluster: config.cluster_name.clone(),
            send_attempts: usize::try_from(config.message_send_attempts.max(1)).unwrap_or(1),
            confirm_timeout: Duration::from_millis(config.general_timeout_millis),
            resync_interval: config.healthcheck_interval().max(Duration::from_millis(10)),
        }
    }

    /// Publish `payload` to `node`, returning how many subscribers got it
    ///
    /// Zero receivers is not an error: the target may not be listening yet.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Unavailable`] when no messaging endpoint is
    /// healthy, otherwise the error of the last endpoint tried once
    /// `message_send_attempts` endpoints failed and none answered.
    pub async fn send_message(&self, node: &NodeAddress, payload: Bytes) -> RedisResult<i64> {
        let channel = messaging_channel(&self.cluster, node);
        let clients = self.pool.healthy_clients().await;
        if clients.is_empty() {
            return Err(RedisError::Unavailable(format!(
                "no healthy messaging endpoint for {channel}"
            )));
        }

        let start = shard_index(&channel, clients.len());
        let mut answered = false;
        let mut failures = 0;
        let mut last_error = None;
        for offset in 0..clients.len() {
            let client = &clients[(start + offset) % clients.len()];
            match client.publish(&channel, payload.clone()).await {
                Ok(0) => {
                    debug!("No subscriber on {} for message to {}", client.uri(), node);
                    answered = true;
                }
                Ok(receivers) => return Ok(receivers),
                Err(e) => {
                    warn!("Publishing to {} via {} failed: {}", node, client.uri(), e);
                    last_error = Some(e);
                    failures += 1;
                    if failures >= self.send_attempts {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(0),
        }
    }

    /// Listen for messages addressed to `node`
    ///
    /// Subscribes on every healthy messaging endpoint before returning and
    /// merges their payloads into one stream. A background task keeps the
    /// subscriptions current until the stream is dropped.
    ///
    /// # Errors
    ///
    /// Fails when no endpoint is healthy or none confirmed the subscription.
    pub async fn subscribe(&self, node: &NodeAddress) -> RedisResult<MessageStream> {
        let channel = messaging_channel(&self.cluster, node);
        if self.pool.healthy_clients().await.is_empty() {
            return Err(RedisError::Unavailable(format!(
                "no healthy messaging endpoint for {channel}"
            )));
        }

        let (inbox, outbox) = mpsc::unbounded_channel();
        let mut subscription = Subscription {
            pool: Arc::clone(&self.pool),
            channel,
            confirm_timeout: self.confirm_timeout,
            inbox,
            readers: HashMap::new(),
        };
        if let Err(e) = subscription.resync().await {
            subscription.stop();
            return Err(e);
        }
        info!("Node {} listening on {}", node, subscription.channel);

        tokio::spawn(subscription.maintain(self.resync_interval));
        Ok(Box::pin(stream::unfold(outbox, |mut outbox| async move {
            outbox.recv().await.map(|item| (item, outbox))
        })))
    }
}

/// Live subscriptions of one channel, keyed by endpoint address
struct Subscription {
    pool: Arc<EndpointPool>,
    channel: String,
    confirm_timeout: Duration,
    inbox: Inbox,
    readers: HashMap<String, JoinHandle<()>>,
}

impl Subscription {
    /// Subscribe on healthy endpoints without a live reader and drop
    /// readers of endpoints that left the pool
    ///
    /// Fails only when no reader is left afterwards.
    async fn resync(&mut self) -> RedisResult<()> {
        let present: HashSet<String> = self
            .pool
            .clients()
            .await
            .iter()
            .map(|c| c.addr().to_string())
            .collect();
        self.readers.retain(|addr, reader| {
            let keep = present.contains(addr) && !reader.is_finished();
            if !keep {
                reader.abort();
            }
            keep
        });

        let mut last_error = None;
        for client in self.pool.healthy_clients().await {
            if self.readers.contains_key(client.addr()) {
                continue;
            }
            match self.listen(&client).await {
                Ok(reader) => {
                    debug!("Subscribed to {} on {}", self.channel, client.uri());
                    self.readers.insert(client.addr().to_string(), reader);
                }
                Err(e) => {
                    warn!("Subscribing to {} on {} failed: {}", self.channel, client.uri(), e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if self.readers.is_empty() => Err(e),
            None if self.readers.is_empty() => Err(RedisError::Unavailable(format!(
                "no messaging endpoint for {}",
                self.channel
            ))),
            _ => Ok(()),
        }
    }

    async fn listen(&self, client: &EndpointClient) -> RedisResult<JoinHandle<()>> {
        let mut conn = client.open_dedicated().await?;
        conn.send("SUBSCRIBE", &[self.channel.as_str().into()]).await?;
        let ack = timeout(self.confirm_timeout, conn.read_push())
            .await
            .map_err(|_| RedisError::Timeout)??;
        confirm_subscription(ack)?;
        Ok(tokio::spawn(forward(conn, self.inbox.clone())))
    }

    async fn maintain(mut self, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let ticked = tokio::select! {
                () = self.inbox.closed() => false,
                _ = ticker.tick() => true,
            };
            if !ticked {
                break;
            }
            if let Err(e) = self.resync().await {
                warn!("No live subscription for {}: {}", self.channel, e);
            }
        }
        debug!("Subscription to {} dropped", self.channel);
        self.stop();
    }

    fn stop(&mut self) {
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
    }
}

fn confirm_subscription(ack: RespValue) -> RedisResult<()> {
    let parts = ack.into_result()?.into_array()?;
    match parts.first() {
        Some(kind) if kind.as_string()? == "subscribe" => Ok(()),
        _ => Err(RedisError::UnexpectedResponse(format!(
            "subscription not confirmed: {parts:?}"
        ))),
    }
}

async fn forward(mut conn: RedisConnection, inbox: Inbox) {
    loop {
        match conn.read_push().await {
            Ok(frame) => {
                if let Some(payload) = message_payload(frame) {
                    if inbox.send(Ok(payload)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Subscriber connection lost: {}", e);
                let _ = inbox.send(Err(e));
                return;
            }
        }
    }
}

/// Payload of a `message` push, `None` for any other frame
fn message_payload(frame: RespValue) -> Option<Bytes> {
    let RespValue::Array(mut parts) = frame else {
        return None;
    };
    if parts.len() != 3 || parts[0].as_string().ok()? != "message" {
        return None;
    }
    match parts.pop()? {
        RespValue::BulkString(payload) => Some(payload),
        _ => None,
    }
}
