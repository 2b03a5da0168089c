//! Concurrent map semantics over one hash bucket
//!
//! Every compound operation runs as exactly one server-side script, so a
//! read-check-write never has an observation window between the read and
//! the write. Plain reads use the hash commands directly.
//!
//! Enumeration of values, keys or entries is not offered: the bucket
//! representation has no reverse index, and walking it from the client
//! would hide the real cost. Those calls fail with
//! [`RedisError::Unsupported`] without touching the backend.

use crate::endpoint::CommandRunner;
use crate::script::MapOp;
use redis_mesh_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::sync::Arc;

/// Map adapter for a single hash bucket on one endpoint
#[derive(Clone)]
pub struct AtomicMap {
    runner: Arc<dyn CommandRunner>,
    bucket: String,
}

impl std::fmt::Debug for AtomicMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicMap")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl AtomicMap {
    /// Bind a bucket name to a command runner (client or pipeline)
    pub fn new(runner: Arc<dyn CommandRunner>, bucket: impl Into<String>) -> Self {
        Self {
            runner,
            bucket: bucket.into(),
        }
    }

    /// Name of the backing hash bucket
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Current value for `key`
    pub async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        self.command("HGET", vec![self.bucket.as_str().into(), key.into()])
            .await?
            .into_optional_string()
    }

    /// Store `value`, returning the previous value
    pub async fn put(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.script(MapOp::Put, vec![key.into(), value.into()])
            .await?
            .into_optional_string()
    }

    /// Remove `key`, returning the previous value
    pub async fn remove(&self, key: &str) -> RedisResult<Option<String>> {
        self.script(MapOp::Remove, vec![key.into()])
            .await?
            .into_optional_string()
    }

    /// Remove `key` only if it currently maps to `expected`
    pub async fn remove_if_equals(&self, key: &str, expected: &str) -> RedisResult<bool> {
        self.script(MapOp::RemoveIfEquals, vec![key.into(), expected.into()])
            .await?
            .as_bool()
    }

    /// Store `value` unless `key` is present; returns the value already there
    pub async fn put_if_absent(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.script(MapOp::PutIfAbsent, vec![key.into(), value.into()])
            .await?
            .into_optional_string()
    }

    /// Store `new` only if `key` currently maps to `expected`
    pub async fn replace_if_equals(&self, key: &str, expected: &str, new: &str) -> RedisResult<bool> {
        self.script(
            MapOp::ReplaceIfEquals,
            vec![key.into(), expected.into(), new.into()],
        )
        .await?
        .as_bool()
    }

    /// Store `value` only if `key` is present, returning the previous value
    pub async fn replace(&self, key: &str, value: &str) -> RedisResult<Option<String>> {
        self.script(MapOp::Replace, vec![key.into(), value.into()])
            .await?
            .into_optional_string()
    }

    /// Number of entries in the bucket
    pub async fn size(&self) -> RedisResult<usize> {
        let len = self
            .command("HLEN", vec![self.bucket.as_str().into()])
            .await?
            .as_int()?;
        Ok(usize::try_from(len).unwrap_or(0))
    }

    /// Whether the bucket holds no entries
    pub async fn is_empty(&self) -> RedisResult<bool> {
        Ok(self.size().await? == 0)
    }

    /// Whether `key` is present
    pub async fn contains_key(&self, key: &str) -> RedisResult<bool> {
        self.command("HEXISTS", vec![self.bucket.as_str().into(), key.into()])
            .await?
            .as_bool()
    }

    /// Delete the whole bucket
    pub async fn clear(&self) -> RedisResult<()> {
        self.command("DEL", vec![self.bucket.as_str().into()])
            .await?;
        Ok(())
    }

    /// Store every pair with independent `put` calls
    ///
    /// There is no atomicity across keys; an error stops the sequence and
    /// leaves earlier writes in place.
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

    /// Not supported: the bucket has no value index
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

    async fn command(&self, command: &str, args: Vec<RespValue>) -> RedisResult<RespValue> {
        self.runner.execute(command, args).await
    }

    async fn script(&self, op: MapOp, args: Vec<RespValue>) -> RedisResult<RespValue> {
        op.script()
            .execute(self.runner.as_ref(), &[self.bucket.as_str()], args)
            .await
    }
}
