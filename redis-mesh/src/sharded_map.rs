//! A logical map spread over several hash buckets
//!
//! Keys are routed with CRC16/XMODEM modulo the bucket count, which is
//! stable across processes and platforms. Bucket `i` is named
//! `<name>#<i>` and lives on endpoint `i % endpoints`. Changing the bucket
//! count remaps keys; that is an operational event and nothing here
//! rebalances existing entries.

use crate::atomic_map::AtomicMap;
use crate::endpoint::CommandRunner;
use crc16::{State, XMODEM};
use futures_util::future::try_join_all;
use redis_mesh_core::error::{RedisError, RedisResult};
use std::sync::Arc;

/// Stable shard index for `key` among `shard_count` shards
#[must_use]
pub fn shard_index(key: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    usize::from(State::<XMODEM>::calculate(key.as_bytes())) % shard_count
}

/// A map sharded across hash buckets on one or more endpoints
#[derive(Debug, Clone)]
pub struct ShardedMap {
    name: String,
    shards: Vec<AtomicMap>,
}

impl ShardedMap {
    /// Build `buckets` shards over `runners`
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] if there are no runners or no buckets.
    pub fn new(
        name: impl Into<String>,
        runners: &[Arc<dyn CommandRunner>],
        buckets: usize,
    ) -> RedisResult<Self> {
        let name = name.into();
        if runners.is_empty() {
            return Err(RedisError::Config(format!("Map {name} has no endpoints")));
        }
        if buckets == 0 {
            return Err(RedisError::Config(format!("Map {name} needs at least one bucket")));
        }

        let shards = (0..buckets)
            .map(|i| {
                let runner = Arc::clone(&runners[i % runners.len()]);
                AtomicMap::new(runner, format!("{name}#{i}"))
            })
            .collect();
        Ok(Self { name, shards })
    }

    /// Logical map name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Every shard, in index order
    pub fn shards(&self) -> &[AtomicMap] {
        &self.shards
    }

    /// The shard responsible for `key`
    pub fn shard_for(&self, key: &str) -> &AtomicMap {
        &self.shards[shard_index(key, self.shards.len())]
    }

    /// Current value for `key`
    pub async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        self.shard_for(key).get(key).await
    }

    /// Store `value`, returning the previous value
    pub async fn put(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.shard_for(key).put(key, value).await
    }

    /// Remove `key`, returning the previous value
    pub async fn remove(&self, key: &str) -> RedisResult<Option<String>> {
        self.shard_for(key).remove(key).await
    }

    /// Remove `key` only if it maps to `expected`
    pub async fn remove_if_equals(&self, key: &str, expected: &str) -> RedisResult<bool> {
        self.shard_for(key).remove_if_equals(key, expected).await
    }

    /// Store `value` unless `key` is present
    pub async fn put_if_absent(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.shard_for(key).put_if_absent(key, value).await
    }

    /// Store `new` only if `key` maps to `expected`
    pub async fn replace_if_equals(&self, key: &str, expected: &str, new: &str) -> RedisResult<bool> {
        self.shard_for(key)
            .replace_if_equals(key, expected, new)
            .await
    }

    /// Store `value` only if `key` is present
    pub async fn replace(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.shard_for(key).replace(key, value).await
    }

    /// Whether `key` is present
    pub async fn contains_key(&self, key: &str) -> RedisResult<bool> {
        self.shard_for(key).contains_key(key).await
    }

    /// Independent puts, each routed to its own shard
    pub async fn put_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> RedisResult<()>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in entries {
            self.put(key.as_ref(), value.as_ref()).await?;
        }
        Ok(())
    }

    /// Sum of the shard sizes, queried concurrently
    ///
    /// Not a point-in-time snapshot: writes racing with the call may or may
    /// not be counted.
    pub async fn size(&self) -> RedisResult<usize> {
        let sizes = try_join_all(self.shards.iter().map(AtomicMap::size)).await?;
        Ok(sizes.into_iter().sum())
    }

    /// Whether every shard is empty
    pub async fn is_empty(&self) -> RedisResult<bool> {
        Ok(self.size().await? == 0)
    }

    /// Clear every shard; readers may observe a partially cleared map
    pub async fn clear(&self) -> RedisResult<()> {
        try_join_all(self.shards.iter().map(AtomicMap::clear)).await?;
        Ok(())
    }

    /// Not supported: the buckets have no value index
    pub fn contains_value(&self, _value: &str) -> RedisResult<bool> {
        Err(RedisError::Unsupported("contains_value"))
    }

    /// Not supported: use a directory scan instead
    pub fn keys(&self) -> RedisResult<Vec<String>> {
        Err(RedisError::Unsupported("keys"))
    }

    /// Not supported: use a directory scan instead
    pub fn values(&self) -> RedisResult<Vec<String>> {
        Err(RedisError::Unsupported("values"))
    }

    /// Not supported: use a directory scan instead
    pub fn entries(&self) -> RedisResult<Vec<(String, String)>> {
        Err(RedisError::Unsupported("entries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointClient;
    use crate::test_server::TestServer;
    use redis_mesh_core::ConnectionConfig;

    async fn runners(servers: &[TestServer]) -> Vec<Arc<dyn CommandRunner>> {
        let mut runners: Vec<Arc<dyn CommandRunner>> = Vec::new();
        for server in servers {
            let client =
                EndpointClient::connect("redis://test", server.addr(), ConnectionConfig::default())
                    .await
                    .unwrap();
            runners.push(Arc::new(client));
        }
        runners
    }

    #[test]
    fn test_shard_index_known_vectors() {
        assert_eq!(shard_index("123456789", 16384), 12739);
        assert_eq!(shard_index("foo", 256), 150);
        assert_eq!(shard_index("bar", 256), 197);
        assert_eq!(shard_index("hello", 256), 98);
        assert_eq!(shard_index("foo", 3), 1);
        assert_eq!(shard_index("bar", 3), 2);
        assert_eq!(shard_index("d", 3), 0);
    }

    #[test]
    fn test_shard_index_is_stable_and_bounded() {
        for i in 0..500 {
            let key = format!("actor-{i}");
            let first = shard_index(&key, 7);
            assert!(first < 7);
            assert_eq!(first, shard_index(&key, 7));
        }
        assert_eq!(shard_index("anything", 1), 0);
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[tokio::test]
    async fn test_rejects_empty_layout() {
        assert!(matches!(
            ShardedMap::new("m", &[], 3),
            Err(RedisError::Config(_))
        ));
        let server = TestServer::start().await;
        let runners = runners(std::slice::from_ref(&server)).await;
        assert!(matches!(
            ShardedMap::new("m", &runners, 0),
            Err(RedisError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_put_size_clear_over_three_shards() {
        let servers = vec![
            TestServer::start().await,
            TestServer::start().await,
            TestServer::start().await,
        ];
        let map = ShardedMap::new("m", &runners(&servers).await, 3).unwrap();

        for key in ["a", "b", "c", "d", "e"] {
            map.put(key, "v").await.unwrap();
        }
        assert_eq!(map.size().await.unwrap(), 5);

        // "d" and "e" hash to shard 0, the rest to shard 1
        assert!(servers[0].contains_key("m#0"));
        assert!(servers[1].contains_key("m#1"));
        assert!(!servers[2].contains_key("m#2"));

        map.clear().await.unwrap();
        assert!(map.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_replace_routed() {
        let servers = vec![TestServer::start().await, TestServer::start().await];
        let map = ShardedMap::new("m", &runners(&servers).await, 8).unwrap();

        map.put("a", "1").await.unwrap();
        assert!(!map.replace_if_equals("a", "wrong", "new").await.unwrap());
        assert_eq!(map.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(map.replace_if_equals("a", "1", "new").await.unwrap());
        assert_eq!(map.get("a").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_single_key_operations() {
        let server = TestServer::start().await;
        let map = ShardedMap::new("m", &runners(std::slice::from_ref(&server)).await, 4).unwrap();

        assert_eq!(map.put_if_absent("k", "v1").await.unwrap(), None);
        assert_eq!(map.put_if_absent("k", "v2").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(map.replace("k", "v3").await.unwrap().as_deref(), Some("v1"));
        assert!(!map.remove_if_equals("k", "v1").await.unwrap());
        assert!(map.remove_if_equals("k", "v3").await.unwrap());
        assert!(!map.contains_key("k").await.unwrap());

        map.put_all([("x", "1"), ("y", "2")]).await.unwrap();
        assert_eq!(map.remove("x").await.unwrap().as_deref(), Some("1"));
        assert_eq!(map.size().await.unwrap(), 1);
        assert!(matches!(map.keys(), Err(RedisError::Unsupported(_))));
    }
}
