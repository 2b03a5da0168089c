//! Configuration types for the cluster backend

use crate::error::{RedisError, RedisResult};
use crate::types::EndpointRole;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PORT: u16 = 6379;

/// A parsed endpoint URI: `redis://[[user]:password@]host[:port][/db]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Password for `AUTH`
    pub password: Option<String>,
    /// Database index for `SELECT`
    pub database: u8,
}

impl EndpointUri {
    /// Parse an endpoint URI
    ///
    /// A missing scheme is accepted and a missing port defaults to 6379.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] for TLS URIs, empty hosts, or
    /// unparsable ports and database indexes.
    pub fn parse(uri: &str) -> RedisResult<Self> {
        let uri = uri.trim();
        if uri.starts_with("rediss://") {
            return Err(RedisError::Config(format!("TLS endpoints are not supported: {uri}")));
        }
        let rest = uri.strip_prefix("redis://").unwrap_or(uri);

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };

        let (password, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let password = match userinfo.split_once(':') {
                    Some((_, password)) => password,
                    None => userinfo,
                };
                let password = (!password.is_empty()).then(|| password.to_string());
                (password, host_port)
            }
            None => (None, authority),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| RedisError::Config(format!("Invalid port in {uri}: {e}")))?;
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(RedisError::Config(format!("Missing host in {uri}")));
        }

        let database = match path {
            Some(db) if !db.is_empty() => db
                .parse::<u8>()
                .map_err(|e| RedisError::Config(format!("Invalid database in {uri}: {e}")))?,
            _ => 0,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            password,
            database,
        })
    }

    /// `host:port` form used for dialing and logging
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-connection settings derived from [`ClusterConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Optional password for authentication
    pub password: Option<String>,

    /// Database number
    pub database: u8,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Read/write operation timeout
    pub operation_timeout: Duration,

    /// Timeout for health-check pings
    pub ping_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,

    /// Number of times a failed connection attempt is retried
    pub retry_attempts: u32,

    /// Fixed pause between connection attempts
    pub retry_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            password: None,
            database: 0,
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(1),
            tcp_keepalive: Some(Duration::from_secs(10)),
            retry_attempts: 5,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl ConnectionConfig {
    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database number
    #[must_use]
    pub const fn with_database(mut self, database: u8) -> Self {
        self.database = database;
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the operation timeout
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the retry policy for connection attempts
    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_interval = interval;
        self
    }
}

/// Configuration for the whole cluster backend
///
/// Field names follow the options the host runtime exposes; durations are
/// stored as milliseconds so the struct deserializes from flat config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name, used to namespace node keys and channels
    pub cluster_name: String,
    /// Endpoints backing the actor directory
    pub actor_directory_uris: Vec<String>,
    /// Endpoints backing the node directory
    pub node_directory_uris: Vec<String>,
    /// Endpoints carrying messages
    pub messaging_uris: Vec<String>,
    /// TTL of a node registration record
    pub node_lifetime_seconds: u64,
    /// Minimum healthy clients per pool before the pool is reported degraded
    pub min_redis_connections: usize,
    /// Maximum clients per pool
    pub max_redis_connections: usize,
    /// Connect timeout
    pub connection_timeout_millis: u64,
    /// Per-command timeout
    pub general_timeout_millis: u64,
    /// TCP keepalive idle time
    pub idle_timeout_millis: u64,
    /// Timeout for a single reconnection attempt
    pub reconnection_timeout_millis: u64,
    /// Timeout for a health-check ping
    pub ping_timeout_millis: u64,
    /// Connection attempts retried before giving up
    pub retry_attempts: u32,
    /// Fixed pause between retries
    pub retry_interval_millis: u64,
    /// Consecutive failed pings before an endpoint is marked unhealthy
    pub failed_attempts: u32,
    /// Messaging clients tried per message
    pub message_send_attempts: u32,
    /// Re-resolve endpoint host names periodically
    pub dns_monitoring: bool,
    /// DNS re-resolution period
    pub dns_monitoring_interval_millis: u64,
    /// Health-check period
    pub messaging_healthcheck_interval_millis: u64,
    /// Number of hash buckets each sharded map spreads over
    pub sharding_buckets: usize,
    /// Route atomic map traffic through the batching pipeline
    pub pipelining: bool,
    /// Pipeline flush interval
    pub redis_pipeline_flush_interval_millis: u64,
    /// Pipeline flush threshold
    pub redis_pipeline_flush_command_count: usize,
    /// Managed cache: dial endpoints by host name instead of resolved address
    pub use_elasticache: bool,
    /// Server-side cluster mode
    pub use_cluster: bool,
    /// Nodes required before the directory reports ready
    pub min_nodes_in_cluster: usize,
    /// Death timeout applied to peers
    pub foreign_node_death_timeout_millis: u64,
    /// Death timeout applied to the local node
    pub local_node_death_timeout_millis: u64,
    /// Delay between death and removal from the directory view
    pub dead_node_culling_delay_millis: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let local = vec!["redis://localhost:6379".to_string()];
        Self {
            cluster_name: "orbit".to_string(),
            actor_directory_uris: local.clone(),
            node_directory_uris: local.clone(),
            messaging_uris: local,
            node_lifetime_seconds: 60,
            min_redis_connections: 10,
            max_redis_connections: 64,
            connection_timeout_millis: 5_000,
            general_timeout_millis: 3_000,
            idle_timeout_millis: 10_000,
            reconnection_timeout_millis: 1_000,
            ping_timeout_millis: 1_000,
            retry_attempts: 5,
            retry_interval_millis: 1_000,
            failed_attempts: u32::MAX,
            message_send_attempts: 1,
            dns_monitoring: true,
            dns_monitoring_interval_millis: 10_000,
            messaging_healthcheck_interval_millis: 10_000,
            sharding_buckets: 256,
            pipelining: true,
            redis_pipeline_flush_interval_millis: 10,
            redis_pipeline_flush_command_count: 16,
            use_elasticache: false,
            use_cluster: false,
            min_nodes_in_cluster: 1,
            foreign_node_death_timeout_millis: 20_000,
            local_node_death_timeout_millis: 10_000,
            dead_node_culling_delay_millis: 24 * 60 * 60 * 1_000,
        }
    }
}

impl ClusterConfig {
    /// Create a configuration with every role pointed at the same endpoints
    pub fn new<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let uris: Vec<String> = uris.into_iter().map(Into::into).collect();
        Self {
            actor_directory_uris: uris.clone(),
            node_directory_uris: uris.clone(),
            messaging_uris: uris,
            ..Default::default()
        }
    }

    /// Set the cluster name
    #[must_use]
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Set the endpoints of one role
    #[must_use]
    pub fn with_role_uris(mut self, role: EndpointRole, uris: Vec<String>) -> Self {
        match role {
            EndpointRole::ActorDirectory => self.actor_directory_uris = uris,
            EndpointRole::NodeDirectory => self.node_directory_uris = uris,
            EndpointRole::Messaging => self.messaging_uris = uris,
        }
        self
    }

    /// Set the number of hash buckets per sharded map
    #[must_use]
    pub const fn with_sharding_buckets(mut self, buckets: usize) -> Self {
        self.sharding_buckets = buckets;
        self
    }

    /// Set the node registration lifetime
    #[must_use]
    pub const fn with_node_lifetime_seconds(mut self, seconds: u64) -> Self {
        self.node_lifetime_seconds = seconds;
        self
    }

    /// Set the death timeouts
    #[must_use]
    pub const fn with_death_timeouts(mut self, local_millis: u64, foreign_millis: u64) -> Self {
        self.local_node_death_timeout_millis = local_millis;
        self.foreign_node_death_timeout_millis = foreign_millis;
        self
    }

    /// Set the culling delay
    #[must_use]
    pub const fn with_culling_delay_millis(mut self, millis: u64) -> Self {
        self.dead_node_culling_delay_millis = millis;
        self
    }

    /// Enable or disable DNS monitoring
    #[must_use]
    pub const fn with_dns_monitoring(mut self, enabled: bool) -> Self {
        self.dns_monitoring = enabled;
        self
    }

    /// Enable or disable the batching pipeline
    #[must_use]
    pub const fn with_pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    /// Set the retry policy
    #[must_use]
    pub const fn with_retry(mut self, attempts: u32, interval_millis: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_interval_millis = interval_millis;
        self
    }

    /// Set the consecutive-failure threshold
    #[must_use]
    pub const fn with_failed_attempts(mut self, attempts: u32) -> Self {
        self.failed_attempts = attempts;
        self
    }

    /// Set the health-check period
    #[must_use]
    pub const fn with_healthcheck_interval_millis(mut self, millis: u64) -> Self {
        self.messaging_healthcheck_interval_millis = millis;
        self
    }

    /// Set how many active nodes make the cluster ready
    #[must_use]
    pub const fn with_min_nodes_in_cluster(mut self, nodes: usize) -> Self {
        self.min_nodes_in_cluster = nodes;
        self
    }

    /// Set how many endpoints a message send may try
    #[must_use]
    pub const fn with_message_send_attempts(mut self, attempts: u32) -> Self {
        self.message_send_attempts = attempts;
        self
    }

    /// Endpoints configured for a role
    #[must_use]
    pub fn uris(&self, role: EndpointRole) -> &[String] {
        match role {
            EndpointRole::ActorDirectory => &self.actor_directory_uris,
            EndpointRole::NodeDirectory => &self.node_directory_uris,
            EndpointRole::Messaging => &self.messaging_uris,
        }
    }

    /// Node registration TTL
    #[must_use]
    pub const fn node_lifetime(&self) -> Duration {
        Duration::from_secs(self.node_lifetime_seconds)
    }

    /// Heartbeat cadence, a third of the registration TTL
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.node_lifetime() / 3).max(Duration::from_millis(100))
    }

    /// Membership check cadence, a quarter of the shorter death timeout
    ///
    /// Keeps at least one check between a missed registration and the
    /// death timeout, so a node passes through suspect before it dies.
    #[must_use]
    pub fn membership_check_interval(&self) -> Duration {
        let shortest = self.local_death_timeout().min(self.foreign_death_timeout());
        (shortest / 4).max(Duration::from_millis(10))
    }

    /// Death timeout for the local node
    #[must_use]
    pub const fn local_death_timeout(&self) -> Duration {
        Duration::from_millis(self.local_node_death_timeout_millis)
    }

    /// Death timeout for peers
    #[must_use]
    pub const fn foreign_death_timeout(&self) -> Duration {
        Duration::from_millis(self.foreign_node_death_timeout_millis)
    }

    /// Delay before a dead node is culled
    #[must_use]
    pub const fn culling_delay(&self) -> Duration {
        Duration::from_millis(self.dead_node_culling_delay_millis)
    }

    /// DNS re-resolution period
    #[must_use]
    pub const fn dns_monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.dns_monitoring_interval_millis)
    }

    /// Health-check period
    #[must_use]
    pub const fn healthcheck_interval(&self) -> Duration {
        Duration::from_millis(self.messaging_healthcheck_interval_millis)
    }

    /// Pipeline flush interval
    #[must_use]
    pub const fn pipeline_flush_interval(&self) -> Duration {
        Duration::from_millis(self.redis_pipeline_flush_interval_millis)
    }

    /// Connection settings for one endpoint
    #[must_use]
    pub fn connection_config(&self, endpoint: &EndpointUri) -> ConnectionConfig {
        ConnectionConfig {
            password: endpoint.password.clone(),
            database: endpoint.database,
            connect_timeout: Duration::from_millis(
                self.connection_timeout_millis.max(self.reconnection_timeout_millis),
            ),
            operation_timeout: Duration::from_millis(self.general_timeout_millis),
            ping_timeout: Duration::from_millis(self.ping_timeout_millis),
            tcp_keepalive: (self.idle_timeout_millis > 0)
                .then(|| Duration::from_millis(self.idle_timeout_millis)),
            retry_attempts: self.retry_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_millis),
        }
    }

    /// Check the configuration for values the backend cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] describing the first problem found.
    pub fn validate(&self) -> RedisResult<()> {
        if self.cluster_name.is_empty() {
            return Err(RedisError::Config("cluster_name must not be empty".to_string()));
        }
        for role in EndpointRole::ALL {
            let uris = self.uris(role);
            if uris.is_empty() {
                return Err(RedisError::Config(format!("No endpoints configured for {role}")));
            }
            for uri in uris {
                EndpointUri::parse(uri)?;
            }
        }
        if self.use_cluster {
            return Err(RedisError::Config(
                "server-side cluster mode is not supported; list shard endpoints instead"
                    .to_string(),
            ));
        }
        if self.min_redis_connections > self.max_redis_connections {
            return Err(RedisError::Config(format!(
                "min_redis_connections ({}) exceeds max_redis_connections ({})",
                self.min_redis_connections, self.max_redis_connections
            )));
        }
        if self.max_redis_connections == 0 {
            return Err(RedisError::Config("max_redis_connections must be positive".to_string()));
        }
        if self.sharding_buckets == 0 {
            return Err(RedisError::Config("sharding_buckets must be positive".to_string()));
        }
        if self.node_lifetime_seconds == 0 {
            return Err(RedisError::Config("node_lifetime_seconds must be positive".to_string()));
        }
        if self.failed_attempts == 0 {
            return Err(RedisError::Config("failed_attempts must be positive".to_string()));
        }
        if self.redis_pipeline_flush_command_count == 0 {
            return Err(RedisError::Config(
                "redis_pipeline_flush_command_count must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = EndpointUri::parse("redis://:secret@cache.internal:6380/2").unwrap();
        assert_eq!(uri.host, "cache.internal");
        assert_eq!(uri.port, 6380);
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.database, 2);
        assert_eq!(uri.authority(), "cache.internal:6380");
    }

    #[test]
    fn test_parse_defaults() {
        let uri = EndpointUri::parse("localhost").unwrap();
        assert_eq!(uri.port, 6379);
        assert_eq!(uri.password, None);
        assert_eq!(uri.database, 0);

        let uri = EndpointUri::parse("redis://user:pw@10.0.0.1").unwrap();
        assert_eq!(uri.host, "10.0.0.1");
        assert_eq!(uri.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(EndpointUri::parse("rediss://host:6379").is_err());
        assert!(EndpointUri::parse("redis://:6379").is_err());
        assert!(EndpointUri::parse("redis://host:notaport").is_err());
        assert!(EndpointUri::parse("redis://host:6379/db").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.node_lifetime_seconds, 60);
        assert_eq!(config.sharding_buckets, 256);
        assert_eq!(config.redis_pipeline_flush_command_count, 16);
        assert_eq!(config.foreign_death_timeout(), Duration::from_secs(20));
        assert_eq!(config.local_death_timeout(), Duration::from_secs(10));
        assert_eq!(config.culling_delay(), Duration::from_secs(86_400));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(config.membership_check_interval(), Duration::from_millis(2_500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = ClusterConfig::default().with_role_uris(EndpointRole::Messaging, vec![]);
        assert!(matches!(config.validate(), Err(RedisError::Config(_))));

        let config = ClusterConfig::default().with_sharding_buckets(0);
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.min_redis_connections = 100;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.use_cluster = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_config_from_cluster_config() {
        let config = ClusterConfig::new(["redis://h:1"]).with_retry(3, 250);
        let endpoint = EndpointUri::parse("redis://:pw@h:1/4").unwrap();
        let conn = config.connection_config(&endpoint);
        assert_eq!(conn.password.as_deref(), Some("pw"));
        assert_eq!(conn.database, 4);
        assert_eq!(conn.retry_attempts, 3);
        assert_eq!(conn.retry_interval, Duration::from_millis(250));
        assert_eq!(conn.operation_timeout, Duration::from_millis(3_000));
    }
}
