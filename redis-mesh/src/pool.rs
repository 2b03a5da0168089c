//! Endpoint pools, one per role
//!
//! A pool holds one slot per configured URI. Each slot resolves to one
//! client per address the host name resolves to; routing picks the first
//! healthy client of the slot. The slot list never changes after startup,
//! so shard routing over slots is stable, while the clients inside a slot
//! are swapped when DNS answers change.
//!
//! Refreshes replace `Arc`s under the write lock and never touch a client
//! in place: a call that already holds a client finishes against it.

use crate::endpoint::{CommandRunner, EndpointClient};
use crate::pipeline::BatchExecutor;
use crate::protocol::CommandFrame;
use async_trait::async_trait;
use futures_util::future::join_all;
use redis_mesh_core::{
    config::{ClusterConfig, EndpointUri},
    error::{RedisError, RedisResult},
    types::{EndpointRole, EndpointState},
    value::RespValue,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Resolves host names to socket addresses
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Every address `host:port` currently resolves to
    async fn resolve(&self, host: &str, port: u16) -> RedisResult<Vec<SocketAddr>>;
}

/// System resolver backed by `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> RedisResult<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| RedisError::Connection(format!("Failed to resolve {host}: {e}")))?
            .collect();
        Ok(addrs)
    }
}

/// Outcome of one health-check pass over a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolHealth {
    /// Clients answering pings
    pub healthy: usize,
    /// Clients excluded from routing
    pub degraded: usize,
}

struct EndpointSlot {
    raw: String,
    uri: EndpointUri,
    clients: Vec<Arc<EndpointClient>>,
}

impl EndpointSlot {
    fn addrs(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.addr().to_string()).collect()
    }
}

/// The clients serving one role
pub struct EndpointPool {
    role: EndpointRole,
    config: ClusterConfig,
    resolver: Arc<dyn Resolver>,
    slots: RwLock<Vec<EndpointSlot>>,
}

impl std::fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointPool")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl EndpointPool {
    /// Resolve and connect every endpoint configured for `role`
    ///
    /// # Errors
    ///
    /// Fails fast on unparsable URIs, unresolvable hosts, unreachable
    /// endpoints, or more clients than `max_redis_connections`.
    pub async fn connect(
        role: EndpointRole,
        config: &ClusterConfig,
        resolver: Arc<dyn Resolver>,
    ) -> RedisResult<Self> {
        let pool = Self {
            role,
            config: config.clone(),
            resolver,
            slots: RwLock::new(Vec::new()),
        };

        let mut slots = Vec::new();
        let mut total = 0;
        for raw in config.uris(role) {
            let uri = EndpointUri::parse(raw)?;
            let addrs = pool.addresses_for(&uri).await?;
            total += addrs.len();
            pool.check_capacity(total)?;

            let mut clients = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let client =
                    EndpointClient::connect(raw.clone(), addr, config.connection_config(&uri)).await?;
                clients.push(Arc::new(client));
            }
            slots.push(EndpointSlot {
                raw: raw.clone(),
                uri,
                clients,
            });
        }

        info!("{} pool ready with {} endpoints and {} clients", role, slots.len(), total);
        *pool.slots.write().await = slots;
        Ok(pool)
    }

    /// Role served by this pool
    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// Number of slots, one per configured URI
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether the pool has no slots
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Routable client for a slot
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Unavailable`] when every client of the slot is
    /// degraded.
    pub async fn client(&self, slot: usize) -> RedisResult<Arc<EndpointClient>> {
        let slots = self.slots.read().await;
        if slots.is_empty() {
            return Err(RedisError::Unavailable(format!("{} pool is empty", self.role)));
        }
        let slot = &slots[slot % slots.len()];
        slot.clients
            .iter()
            .find(|c| c.is_healthy())
            .cloned()
            .ok_or_else(|| RedisError::Unavailable(slot.raw.clone()))
    }

    /// Every client in slot order
    pub async fn clients(&self) -> Vec<Arc<EndpointClient>> {
        self.slots
            .read()
            .await
            .iter()
            .flat_map(|slot| slot.clients.iter().cloned())
            .collect()
    }

    /// Routable clients in slot order
    pub async fn healthy_clients(&self) -> Vec<Arc<EndpointClient>> {
        let mut clients = self.clients().await;
        clients.retain(|c| c.is_healthy());
        clients
    }

    /// One runner per slot that always routes to the slot's current client
    pub async fn runners(self: &Arc<Self>) -> Vec<Arc<PooledRunner>> {
        (0..self.len().await)
            .map(|slot| {
                Arc::new(PooledRunner {
                    pool: Arc::clone(self),
                    slot,
                })
            })
            .collect()
    }

    /// Re-resolve every slot and swap clients whose addresses changed
    ///
    /// Clients for addresses that are still present are kept. Returns the
    /// number of slots that changed. Resolution failures keep the current
    /// clients.
    pub async fn refresh_dns(&self) -> usize {
        if self.config.use_elasticache {
            return 0;
        }

        let snapshot: Vec<(EndpointUri, Vec<String>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|slot| (slot.uri.clone(), slot.addrs()))
            .collect();

        let mut changed = 0;
        for (index, (uri, current)) in snapshot.into_iter().enumerate() {
            let fresh = match self.addresses_for(&uri).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!("DNS refresh for {} failed, keeping current clients: {}", uri.host, e);
                    continue;
                }
            };
            if fresh == current {
                continue;
            }

            let mut slots = self.slots.write().await;
            let others: usize = slots
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, s)| s.clients.len())
                .sum();
            if let Err(e) = self.check_capacity(others + fresh.len()) {
                warn!("Skipping DNS change for {}: {}", uri.host, e);
                continue;
            }
            let Some(slot) = slots.get_mut(index) else {
                continue;
            };

            let connection = self.config.connection_config(&slot.uri);
            let clients: Vec<Arc<EndpointClient>> = fresh
                .iter()
                .map(|addr| {
                    slot.clients
                        .iter()
                        .find(|c| c.addr() == addr)
                        .cloned()
                        .unwrap_or_else(|| {
                            Arc::new(EndpointClient::new(
                                slot.raw.clone(),
                                addr.clone(),
                                connection.clone(),
                            ))
                        })
                })
                .collect();
            info!(
                "{} endpoint {} moved from {:?} to {:?}",
                self.role, slot.raw, current, fresh
            );
            slot.clients = clients;
            changed += 1;
        }
        changed
    }

    /// Ping every client once and update its state
    pub async fn health_check(&self) -> PoolHealth {
        let clients = self.clients().await;
        let states = join_all(
            clients
                .iter()
                .map(|c| c.check_health(self.config.failed_attempts)),
        )
        .await;

        let health = PoolHealth {
            healthy: states.iter().filter(|s| **s == EndpointState::Live).count(),
            degraded: states
                .iter()
                .filter(|s| **s == EndpointState::Degraded)
                .count(),
        };
        let floor = self.config.min_redis_connections.min(clients.len());
        if health.healthy < floor {
            warn!(
                "{} pool has {} healthy clients, below the minimum of {}",
                self.role, health.healthy, floor
            );
        } else {
            debug!("{} pool health: {:?}", self.role, health);
        }
        health
    }

    /// Close every client
    pub async fn shutdown(&self) {
        for client in self.clients().await {
            client.close().await;
        }
        debug!("{} pool shut down", self.role);
    }

    async fn addresses_for(&self, uri: &EndpointUri) -> RedisResult<Vec<String>> {
        if self.config.use_elasticache {
            return Ok(vec![uri.authority()]);
        }
        let mut addrs: Vec<String> = self
            .resolver
            .resolve(&uri.host, uri.port)
            .await?
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        addrs.sort();
        addrs.dedup();
        if addrs.is_empty() {
            return Err(RedisError::Connection(format!(
                "{} resolved to no addresses",
                uri.host
            )));
        }
        Ok(addrs)
    }

    fn check_capacity(&self, total: usize) -> RedisResult<()> {
        if total > self.config.max_redis_connections {
            return Err(RedisError::Config(format!(
                "{} pool needs {} clients, above max_redis_connections ({})",
                self.role, total, self.config.max_redis_connections
            )));
        }
        Ok(())
    }
}

/// Routes each call to the current client of one pool slot
#[derive(Debug)]
pub struct PooledRunner {
    pool: Arc<EndpointPool>,
    slot: usize,
}

impl PooledRunner {
    /// Slot index this runner routes to
    pub fn slot(&self) -> usize {
        self.slot
    }
}

#[async_trait]
impl CommandRunner for PooledRunner {
    async fn execute(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        let client = self.pool.client(self.slot).await?;
        client.execute(command, args).await
    }
}

#[async_trait]
impl BatchExecutor for PooledRunner {
    async fn execute_batch(&self, commands: Vec<CommandFrame>) -> RedisResult<Vec<RespValue>> {
        let client = self.pool.client(self.slot).await?;
        client.execute_pipeline(&commands).await
    }
}
