//! Connection manager for the three endpoint roles
//!
//! Builds one [`EndpointPool`] per role at startup and supervises them with
//! two background timers: DNS re-resolution and health checks. The timers
//! hold weak references, so dropping the manager stops them.

use crate::endpoint::{CommandRunner, EndpointClient};
use crate::pipeline::BatchingPipeline;
use crate::pool::{DnsResolver, EndpointPool, PoolHealth, Resolver};
use redis_mesh_core::{
    config::ClusterConfig,
    error::{RedisError, RedisResult},
    types::EndpointRole,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Owns the endpoint pools and their supervision timers
pub struct ConnectionManager {
    config: ClusterConfig,
    actor_directory: Arc<EndpointPool>,
    node_directory: Arc<EndpointPool>,
    messaging: Arc<EndpointPool>,
    actor_runners: Vec<Arc<dyn CommandRunner>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("cluster_name", &self.config.cluster_name)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validate `config`, connect every pool and start the timers
    ///
    /// # Errors
    ///
    /// Fails fast on invalid configuration or unreachable endpoints.
    pub async fn connect(config: ClusterConfig) -> RedisResult<Arc<Self>> {
        Self::connect_with_resolver(config, Arc::new(DnsResolver)).await
    }

    /// Same as [`ConnectionManager::connect`] with a custom resolver
    pub async fn connect_with_resolver(
        config: ClusterConfig,
        resolver: Arc<dyn Resolver>,
    ) -> RedisResult<Arc<Self>> {
        config.validate()?;

        let actor_directory = Arc::new(
            EndpointPool::connect(EndpointRole::ActorDirectory, &config, Arc::clone(&resolver))
                .await?,
        );
        let node_directory = Arc::new(
            EndpointPool::connect(EndpointRole::NodeDirectory, &config, Arc::clone(&resolver))
                .await?,
        );
        let messaging =
            Arc::new(EndpointPool::connect(EndpointRole::Messaging, &config, resolver).await?);

        let mut actor_runners: Vec<Arc<dyn CommandRunner>> = Vec::new();
        for runner in actor_directory.runners().await {
            if config.pipelining {
                actor_runners.push(Arc::new(BatchingPipeline::new(
                    runner,
                    config.pipeline_flush_interval(),
                    config.redis_pipeline_flush_command_count,
                )));
            } else {
                actor_runners.push(runner);
            }
        }

        let manager = Arc::new(Self {
            config,
            actor_directory,
            node_directory,
            messaging,
            actor_runners,
            timers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        manager.start_timers();
        info!("Connection manager ready for cluster {}", manager.config.cluster_name);
        Ok(manager)
    }

    /// Configuration the manager was built from
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Pool serving `role`
    pub fn pool(&self, role: EndpointRole) -> &Arc<EndpointPool> {
        match role {
            EndpointRole::ActorDirectory => &self.actor_directory,
            EndpointRole::NodeDirectory => &self.node_directory,
            EndpointRole::Messaging => &self.messaging,
        }
    }

    /// Current clients for `role`, in slot order
    pub async fn clients(&self, role: EndpointRole) -> Vec<Arc<EndpointClient>> {
        self.pool(role).clients().await
    }

    /// One runner per actor-directory slot, batched when pipelining is on
    pub fn actor_directory_runners(&self) -> &[Arc<dyn CommandRunner>] {
        &self.actor_runners
    }

    /// Re-resolve every pool now
    pub async fn refresh_dns(&self) -> usize {
        let mut changed = 0;
        for role in EndpointRole::ALL {
            changed += self.pool(role).refresh_dns().await;
        }
        changed
    }

    /// Health-check every pool now
    pub async fn health_check(&self) -> PoolHealth {
        let mut total = PoolHealth::default();
        for role in EndpointRole::ALL {
            let health = self.pool(role).health_check().await;
            total.healthy += health.healthy;
            total.degraded += health.degraded;
        }
        total
    }

    /// Stop the timers and close every client
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let timers: Vec<JoinHandle<()>> = match self.timers.lock() {
            Ok(mut timers) => timers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for timer in timers {
            timer.abort();
        }
        for role in EndpointRole::ALL {
            self.pool(role).shutdown().await;
        }
        info!("Connection manager for {} shut down", self.config.cluster_name);
    }

    /// Whether [`ConnectionManager::shutdown`] has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fail with [`RedisError::Shutdown`] once the manager is closed
    pub fn ensure_open(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::Shutdown(self.config.cluster_name.clone()));
        }
        Ok(())
    }

    fn start_timers(self: &Arc<Self>) {
        let mut handles = Vec::new();
        if self.config.dns_monitoring && !self.config.use_elasticache {
            handles.push(spawn_timer(
                Arc::downgrade(self),
                self.config.dns_monitoring_interval(),
                |manager| async move {
                    let changed = manager.refresh_dns().await;
                    if changed > 0 {
                        info!("DNS refresh swapped {} endpoints", changed);
                    }
                },
            ));
        }
        handles.push(spawn_timer(
            Arc::downgrade(self),
            self.config.healthcheck_interval(),
            |manager| async move {
                manager.health_check().await;
            },
        ));
        match self.timers.lock() {
            Ok(mut timers) => timers.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }
}

fn spawn_timer<F, Fut>(manager: Weak<ConnectionManager>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<ConnectionManager>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            tick(manager).await;
        }
        debug!("Connection manager timer stopped");
    })
}
