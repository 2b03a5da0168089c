//! TTL-driven node membership
//!
//! Every process writes `<cluster>:node:<address>` on the node-directory
//! endpoint its key hashes to, with a TTL of the node lifetime, and
//! refreshes it three times per lifetime. Membership is whatever a scan of
//! those keys finds. Key expiry is the only liveness signal.
//!
//! Observations feed a per-node state machine:
//!
//! ```text
//! unknown --seen--> Alive --missing--> Suspect --timeout--> Dead --delay--> culled
//!                     ^                   |
//!                     +------seen---------+
//! ```
//!
//! The death timeout is shorter for the local node than for peers. A dead
//! node stays dead until it is culled, even if its record shows up again.

use crate::endpoint::EndpointClient;
use crate::pool::EndpointPool;
use crate::sharded_map::shard_index;
use redis_mesh_core::{
    config::ClusterConfig,
    error::RedisResult,
    types::NodeAddress,
    value::RespValue,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SCAN_PAGE_SIZE: usize = 1000;
const EVENT_CAPACITY: usize = 256;

/// Cache key holding a node's registration
pub fn node_key(cluster: &str, node: &NodeAddress) -> String {
    format!("{cluster}:node:{node}")
}

/// Scan pattern matching every registration of `cluster`
pub fn node_pattern(cluster: &str) -> String {
    format!("{}:node:*", escape_glob(cluster))
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Observed state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Registration seen on the last check
    Alive,
    /// Registration missing, death timeout not yet reached
    Suspect,
    /// No sighting for longer than the death timeout
    Dead,
}

/// A membership change, as broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// First sighting of a node
    Joined(NodeAddress),
    /// Registration missing on a re-check
    Suspected(NodeAddress),
    /// Suspect node seen again
    Recovered(NodeAddress),
    /// Death timeout elapsed without a sighting
    Died(NodeAddress),
    /// Dead node removed from the view
    Culled(NodeAddress),
}

impl MembershipEvent {
    /// Node the event is about
    pub fn node(&self) -> &NodeAddress {
        match self {
            Self::Joined(n)
            | Self::Suspected(n)
            | Self::Recovered(n)
            | Self::Died(n)
            | Self::Culled(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeRecord {
    status: NodeStatus,
    last_seen: Instant,
    dead_since: Option<Instant>,
}

/// Pure membership state machine driven by explicit observation times
#[derive(Debug)]
pub struct NodeTracker {
    local: NodeAddress,
    local_timeout: Duration,
    foreign_timeout: Duration,
    culling_delay: Duration,
    nodes: BTreeMap<NodeAddress, NodeRecord>,
}

impl NodeTracker {
    /// Create a tracker judging `local` with the local timeout
    pub fn new(
        local: NodeAddress,
        local_timeout: Duration,
        foreign_timeout: Duration,
        culling_delay: Duration,
    ) -> Self {
        Self {
            local,
            local_timeout,
            foreign_timeout,
            culling_delay,
            nodes: BTreeMap::new(),
        }
    }

    /// Create a tracker with the timeouts from `config`
    pub fn from_config(local: NodeAddress, config: &ClusterConfig) -> Self {
        Self::new(
            local,
            config.local_death_timeout(),
            config.foreign_death_timeout(),
            config.culling_delay(),
        )
    }

    /// Apply one scan result taken at `now`
    ///
    /// `seen` holds every node whose registration was present.
    pub fn observe(&mut self, seen: &HashSet<NodeAddress>, now: Instant) -> Vec<MembershipEvent> {
        self.observe_partial(seen, &HashSet::new(), now)
    }

    /// Apply a scan that could not look at every registration
    ///
    /// Nodes in `unobserved` keep their state: their records were neither
    /// found nor confirmed missing.
    pub fn observe_partial(
        &mut self,
        seen: &HashSet<NodeAddress>,
        unobserved: &HashSet<NodeAddress>,
        now: Instant,
    ) -> Vec<MembershipEvent> {
        let mut events = Vec::new();

        let mut culled = Vec::new();
        for (node, record) in &mut self.nodes {
            if unobserved.contains(node) && !seen.contains(node) {
                continue;
            }
            if seen.contains(node) {
                match record.status {
                    NodeStatus::Alive => record.last_seen = now,
                    NodeStatus::Suspect => {
                        record.status = NodeStatus::Alive;
                        record.last_seen = now;
                        events.push(MembershipEvent::Recovered(node.clone()));
                    }
                    NodeStatus::Dead => {
                        debug!("Ignoring registration of dead node {}", node);
                    }
                }
                if record.status != NodeStatus::Dead {
                    continue;
                }
            }

            match record.status {
                NodeStatus::Alive | NodeStatus::Suspect => {
                    let timeout = if *node == self.local {
                        self.local_timeout
                    } else {
                        self.foreign_timeout
                    };
                    if now.saturating_duration_since(record.last_seen) > timeout {
                        record.status = NodeStatus::Dead;
                        record.dead_since = Some(now);
                        events.push(MembershipEvent::Died(node.clone()));
                    } else if record.status == NodeStatus::Alive {
                        record.status = NodeStatus::Suspect;
                        events.push(MembershipEvent::Suspected(node.clone()));
                    }
                }
                NodeStatus::Dead => {
                    let dead_since = record.dead_since.unwrap_or(record.last_seen);
                    if now.saturating_duration_since(dead_since) >= self.culling_delay {
                        culled.push(node.clone());
                    }
                }
            }
        }

        for node in culled {
            self.nodes.remove(&node);
            events.push(MembershipEvent::Culled(node));
        }

        for node in seen {
            if !self.nodes.contains_key(node) {
                self.nodes.insert(
                    node.clone(),
                    NodeRecord {
                        status: NodeStatus::Alive,
                        last_seen: now,
                        dead_since: None,
                    },
                );
                events.push(MembershipEvent::Joined(node.clone()));
            }
        }

        events
    }

    /// Current status of `node`, `None` when unknown or culled
    pub fn status(&self, node: &NodeAddress) -> Option<NodeStatus> {
        self.nodes.get(node).map(|r| r.status)
    }

    /// Every tracked node with its status, dead ones included until culled
    pub fn view(&self) -> Vec<(NodeAddress, NodeStatus)> {
        self.nodes
            .iter()
            .map(|(node, record)| (node.clone(), record.status))
            .collect()
    }

    /// Every tracked node, dead ones included
    pub fn tracked(&self) -> impl Iterator<Item = &NodeAddress> {
        self.nodes.keys()
    }

    /// Nodes that are alive or merely suspect
    pub fn active_nodes(&self) -> Vec<NodeAddress> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.status != NodeStatus::Dead)
            .map(|(node, _)| node.clone())
            .collect()
    }
}

/// Outcome of one pass over the node-directory endpoints
#[derive(Debug, Clone, Default)]
pub struct NodeScan {
    /// Nodes whose registration was found
    pub seen: HashSet<NodeAddress>,
    /// Slots that could not be scanned
    pub unreachable: Vec<usize>,
    /// Slot count of the pool at scan time
    pub slots: usize,
}

impl NodeScan {
    /// Whether every slot answered
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }

    fn covers(&self, key: &str) -> bool {
        !self.unreachable.contains(&shard_index(key, self.slots))
    }
}

/// Registers the local node and tracks its peers
pub struct NodeDirectory {
    pool: Arc<EndpointPool>,
    cluster: String,
    local: NodeAddress,
    lifetime: Duration,
    heartbeat_interval: Duration,
    check_interval: Duration,
    min_nodes: usize,
    tracker: Mutex<NodeTracker>,
    events: broadcast::Sender<MembershipEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDirectory")
            .field("cluster", &self.cluster)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl NodeDirectory {
    /// Create a directory over the node-directory pool
    pub fn new(pool: Arc<EndpointPool>, config: &ClusterConfig, local: NodeAddress) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pool,
            cluster: config.cluster_name.clone(),
            tracker: Mutex::new(NodeTracker::from_config(local.clone(), config)),
            local,
            lifetime: config.node_lifetime(),
            heartbeat_interval: config.heartbeat_interval(),
            check_interval: config.membership_check_interval(),
            min_nodes: config.min_nodes_in_cluster,
            events,
            task: Mutex::new(None),
        }
    }

    /// Address of the local node
    pub fn local(&self) -> &NodeAddress {
        &self.local
    }

    /// Write the local registration with a fresh TTL
    pub async fn heartbeat(&self) -> RedisResult<()> {
        let key = node_key(&self.cluster, &self.local);
        let client = self.client_for(&key).await?;
        client
            .set(&key, self.local.as_str(), Some(self.lifetime))
            .await?;
        debug!("Heartbeat for {} written to {}", self.local, client.uri());
        Ok(())
    }

    /// Delete the local registration ahead of its expiry
    pub async fn leave(&self) -> RedisResult<()> {
        let key = node_key(&self.cluster, &self.local);
        self.client_for(&key).await?.delete(&key).await?;
        info!("Node {} left cluster {}", self.local, self.cluster);
        Ok(())
    }

    /// Scan every node-directory endpoint for live registrations
    ///
    /// Keys found by the scan are read back in one pipelined batch per
    /// endpoint, so records that expire mid-scan are dropped. A slot that
    /// fails is reported in [`NodeScan::unreachable`] while the others are
    /// still scanned.
    ///
    /// # Errors
    ///
    /// Fails only when no slot could be scanned.
    pub async fn scan_nodes(&self) -> RedisResult<NodeScan> {
        let pattern = node_pattern(&self.cluster);
        let mut scan = NodeScan {
            slots: self.pool.len().await,
            ..NodeScan::default()
        };

        let mut last_error = None;
        for slot in 0..scan.slots {
            match self.scan_slot(slot, &pattern).await {
                Ok(nodes) => scan.seen.extend(nodes),
                Err(e) => {
                    warn!("Node directory slot {} not scanned: {}", slot, e);
                    scan.unreachable.push(slot);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if scan.unreachable.len() == scan.slots => Err(e),
            _ => Ok(scan),
        }
    }

    async fn scan_slot(&self, slot: usize, pattern: &str) -> RedisResult<Vec<NodeAddress>> {
        let client = self.pool.client(slot).await?;
        let keys = client.scan(pattern, SCAN_PAGE_SIZE).collect_all().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let reads: Vec<_> = keys
            .iter()
            .map(|key| ("GET".to_string(), vec![RespValue::from(key.as_str())]))
            .collect();
        let mut nodes = Vec::with_capacity(keys.len());
        for reply in client.execute_pipeline(&reads).await? {
            if let Some(address) = reply.into_result()?.into_optional_string()? {
                nodes.push(NodeAddress::new(address));
            }
        }
        Ok(nodes)
    }

    /// Scan once, advance the state machine and publish the events
    ///
    /// Nodes whose registration lives on a slot that could not be scanned
    /// keep their state. A scan where no slot answered is returned as an
    /// error and leaves every node untouched.
    pub async fn refresh(&self) -> RedisResult<Vec<MembershipEvent>> {
        let scan = self.scan_nodes().await?;
        let events = {
            let mut tracker = self.lock_tracker();
            let unobserved: HashSet<NodeAddress> = if scan.is_complete() {
                HashSet::new()
            } else {
                tracker
                    .tracked()
                    .filter(|node| !scan.covers(&node_key(&self.cluster, node)))
                    .cloned()
                    .collect()
            };
            tracker.observe_partial(&scan.seen, &unobserved, Instant::now())
        };
        for event in &events {
            self.log_event(event);
            // No receivers is fine
            let _ = self.events.send(event.clone());
        }
        Ok(events)
    }

    /// Receive membership events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Nodes currently alive or suspect
    pub fn active_nodes(&self) -> Vec<NodeAddress> {
        self.lock_tracker().active_nodes()
    }

    /// Every tracked node and its status
    pub fn view(&self) -> Vec<(NodeAddress, NodeStatus)> {
        self.lock_tracker().view()
    }

    /// Status of one node
    pub fn status(&self, node: &NodeAddress) -> Option<NodeStatus> {
        self.lock_tracker().status(node)
    }

    /// Whether at least `min_nodes_in_cluster` nodes are active
    pub fn is_ready(&self) -> bool {
        self.active_nodes().len() >= self.min_nodes
    }

    /// Start heartbeating and refreshing in the background
    ///
    /// Heartbeats follow the heartbeat interval; membership is checked on
    /// its own, shorter interval.
    pub fn start(self: &Arc<Self>) {
        let directory = Arc::downgrade(self);
        let beat_period = self.heartbeat_interval;
        let check_period = self.check_interval;
        let handle = tokio::spawn(async move {
            let mut beats = interval_at(Instant::now(), beat_period);
            beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut checks = interval_at(Instant::now(), check_period);
            checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let beat = tokio::select! {
                    biased;
                    _ = beats.tick() => true,
                    _ = checks.tick() => false,
                };
                let Some(directory) = directory.upgrade() else {
                    break;
                };
                if beat {
                    if let Err(e) = directory.heartbeat().await {
                        warn!("Heartbeat for {} failed: {}", directory.local, e);
                    }
                } else if let Err(e) = directory.refresh().await {
                    warn!("Membership refresh failed: {}", e);
                }
            }
        });

        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
        info!(
            "Node {} heartbeating every {:?}, checking membership every {:?} in cluster {}",
            self.local, beat_period, check_period, self.cluster
        );
    }

    /// Stop the background task and delete the local registration
    pub async fn stop(&self) -> RedisResult<()> {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.leave().await
    }

    async fn client_for(&self, key: &str) -> RedisResult<Arc<EndpointClient>> {
        let slots = self.pool.len().await;
        self.pool.client(shard_index(key, slots)).await
    }

    fn lock_tracker(&self) -> MutexGuard<'_, NodeTracker> {
        self.tracker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn log_event(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Joined(node) => info!("Node {} joined cluster {}", node, self.cluster),
            MembershipEvent::Recovered(node) => info!("Node {} is reachable again", node),
            MembershipEvent::Suspected(node) => warn!("Node {} registration missing", node),
            MembershipEvent::Died(node) if *node == self.local => {
                error!("Local node {} considered dead by its own directory", node)
            }
            MembershipEvent::Died(node) => error!("Node {} is dead", node),
            MembershipEvent::Culled(node) => info!("Node {} culled from the directory", node),
        }
    }
}
