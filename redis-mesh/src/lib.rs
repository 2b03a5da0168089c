//! Redis-backed cluster backend for actor runtimes
//!
//! `redis-mesh` keeps the shared state of a cluster of actor hosts in one or
//! more plain Redis endpoints: where each actor lives, which nodes are
//! alive, and a pub/sub channel per node for messages.
//!
//! # Features
//!
//! - Concurrent-map semantics on hash buckets, one server-side script per
//!   compound operation
//! - Stable CRC16 sharding of logical maps over many buckets and endpoints
//! - TTL-based node registrations with suspect/dead/culled tracking
//! - Per-role endpoint pools with DNS re-resolution and health checks
//! - Optional request batching into single round trips
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_mesh::{ClusterConfig, ClusterDirectory, NodeAddress};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new(["redis://localhost:6379"]);
//!     let local = NodeAddress::new("10.0.0.1:9000");
//!     let directory = ClusterDirectory::join(config, local.clone()).await?;
//!
//!     directory.register_actor("player/42", &local).await?;
//!     let owner = directory.lookup_actor("player/42").await?;
//!     println!("player/42 lives on {:?}", owner);
//!
//!     directory.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unused_async)]

pub mod atomic_map;
pub mod cluster;
pub mod connection;
pub mod endpoint;
pub mod liveness;
pub mod manager;
pub mod messaging;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod script;
pub mod sharded_map;

#[cfg(test)]
mod test_server;

pub use atomic_map::AtomicMap;
pub use cluster::ClusterDirectory;
pub use endpoint::{CommandRunner, EndpointClient, KeyScan};
pub use liveness::{MembershipEvent, NodeDirectory, NodeScan, NodeStatus, NodeTracker};
pub use manager::ConnectionManager;
pub use messaging::{MessageStream, Messenger};
pub use pipeline::{BatchExecutor, BatchingPipeline};
pub use pool::{DnsResolver, EndpointPool, PoolHealth, Resolver};
pub use script::{MapOp, Script};
pub use sharded_map::{shard_index, ShardedMap};

pub use redis_mesh_core::{
    config::{ClusterConfig, ConnectionConfig, EndpointUri},
    error::{RedisError, RedisResult},
    types::{EndpointRole, EndpointState, NodeAddress},
    value::RespValue,
};
