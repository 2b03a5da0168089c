//! Cluster directory facade
//!
//! [`ClusterDirectory`] is what a host runtime talks to: actor placement
//! in a sharded map, node membership from the liveness directory, and
//! node-to-node messages. It owns the [`ConnectionManager`] and the local
//! node's registration.

use crate::liveness::{MembershipEvent, NodeDirectory, NodeStatus};
use crate::manager::ConnectionManager;
use crate::messaging::{MessageStream, Messenger};
use crate::sharded_map::ShardedMap;
use bytes::Bytes;
use redis_mesh_core::{
    config::ClusterConfig,
    error::RedisResult,
    types::{EndpointRole, NodeAddress},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Entry point for a node taking part in a cluster
pub struct ClusterDirectory {
    manager: Arc<ConnectionManager>,
    actors: ShardedMap,
    nodes: Arc<NodeDirectory>,
    messenger: Messenger,
}

impl std::fmt::Debug for ClusterDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDirectory")
            .field("local", self.nodes.local())
            .field("actors", &self.actors.name())
            .finish_non_exhaustive()
    }
}

impl ClusterDirectory {
    /// Connect to the backend and register `local` as a member
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, unreachable endpoints or a failed
    /// first registration.
    pub async fn join(config: ClusterConfig, local: NodeAddress) -> RedisResult<Self> {
        let manager = ConnectionManager::connect(config).await?;
        Self::with_manager(manager, local).await
    }

    /// Register `local` using an already connected manager
    pub async fn with_manager(
        manager: Arc<ConnectionManager>,
        local: NodeAddress,
    ) -> RedisResult<Self> {
        let config = manager.config();
        let actors = ShardedMap::new(
            format!("{}:actors", config.cluster_name),
            manager.actor_directory_runners(),
            config.sharding_buckets,
        )?;
        let nodes = Arc::new(NodeDirectory::new(
            Arc::clone(manager.pool(EndpointRole::NodeDirectory)),
            config,
            local,
        ));
        let messenger = Messenger::new(Arc::clone(manager.pool(EndpointRole::Messaging)), config);

        nodes.heartbeat().await?;
        nodes.refresh().await?;
        nodes.start();
        info!("Node {} joined cluster {}", nodes.local(), config.cluster_name);

        Ok(Self {
            manager,
            actors,
            nodes,
            messenger,
        })
    }

    /// Address of this node
    pub fn local(&self) -> &NodeAddress {
        self.nodes.local()
    }

    /// Underlying connection manager
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Actor placement map
    pub fn actors(&self) -> &ShardedMap {
        &self.actors
    }

    /// Liveness directory
    pub fn nodes(&self) -> &Arc<NodeDirectory> {
        &self.nodes
    }

    /// Node currently hosting `actor`
    pub async fn lookup_actor(&self, actor: &str) -> RedisResult<Option<NodeAddress>> {
        self.manager.ensure_open()?;
        Ok(self.actors.get(actor).await?.map(NodeAddress::new))
    }

    /// Claim `actor` for `node` unless another node already owns it
    ///
    /// Returns the existing owner when the claim loses.
    pub async fn register_actor(
        &self,
        actor: &str,
        node: &NodeAddress,
    ) -> RedisResult<Option<NodeAddress>> {
        self.manager.ensure_open()?;
        Ok(self
            .actors
            .put_if_absent(actor, node.as_str())
            .await?
            .map(NodeAddress::new))
    }

    /// Release `actor` if `node` still owns it
    pub async fn unregister_actor(&self, actor: &str, node: &NodeAddress) -> RedisResult<bool> {
        self.manager.ensure_open()?;
        self.actors.remove_if_equals(actor, node.as_str()).await
    }

    /// Hand `actor` from `from` to `to` if `from` still owns it
    pub async fn move_actor(
        &self,
        actor: &str,
        from: &NodeAddress,
        to: &NodeAddress,
    ) -> RedisResult<bool> {
        self.manager.ensure_open()?;
        self.actors
            .replace_if_equals(actor, from.as_str(), to.as_str())
            .await
    }

    /// Nodes currently alive or suspect
    pub fn active_nodes(&self) -> Vec<NodeAddress> {
        self.nodes.active_nodes()
    }

    /// Every tracked node and its status
    pub fn view(&self) -> Vec<(NodeAddress, NodeStatus)> {
        self.nodes.view()
    }

    /// Whether enough nodes are active to serve
    pub fn is_ready(&self) -> bool {
        self.nodes.is_ready()
    }

    /// Receive membership events
    pub fn membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.nodes.subscribe()
    }

    /// Send `payload` to `node`
    pub async fn send_message(&self, node: &NodeAddress, payload: Bytes) -> RedisResult<i64> {
        self.manager.ensure_open()?;
        self.messenger.send_message(node, payload).await
    }

    /// Messages addressed to this node
    pub async fn messages(&self) -> RedisResult<MessageStream> {
        self.manager.ensure_open()?;
        self.messenger.subscribe(self.nodes.local()).await
    }

    /// Leave the cluster and close every connection
    ///
    /// Deleting the registration only speeds up detection by peers; a
    /// failure here is logged and expiry takes over.
    pub async fn shutdown(&self) {
        if self.manager.is_closed() {
            return;
        }
        if let Err(e) = self.nodes.stop().await {
            warn!("Node {} could not remove its registration: {}", self.local(), e);
        }
        self.manager.shutdown().await;
    }
}
