//! Lua scripts executed atomically on the server
//!
//! A [`Script`] carries its SHA1 so it can be run with `EVALSHA`; when the
//! server has not cached it yet, the `NOSCRIPT` reply triggers a single
//! `EVAL` with the full source, which also caches it for later calls.
//!
//! [`MapOp`] holds the hash-bucket scripts behind
//! [`AtomicMap`](crate::atomic_map::AtomicMap). Each one touches a single
//! bucket key, so the server runs it as one atomic step.

use crate::endpoint::CommandRunner;
use redis_mesh_core::{error::RedisResult, value::RespValue};
use sha1::{Digest, Sha1};
use std::sync::OnceLock;
use tracing::debug;

/// A Lua script that can be executed on the server
#[derive(Debug, Clone)]
pub struct Script {
    source: String,
    sha: String,
}

impl Script {
    /// Create a new script from Lua source code
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let sha = calculate_sha1(&source);
        Self { source, sha }
    }

    /// SHA1 hash of the script, as used by `EVALSHA`
    #[must_use]
    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Source code of the script
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run the script through `runner`
    ///
    /// Tries `EVALSHA` first and falls back to `EVAL` if the server answers
    /// `NOSCRIPT`. Any other server error is returned as-is and never
    /// retried.
    pub async fn execute<R>(
        &self,
        runner: &R,
        keys: &[&str],
        args: Vec<RespValue>,
    ) -> RedisResult<RespValue>
    where
        R: CommandRunner + ?Sized,
    {
        match runner
            .execute("EVALSHA", Self::eval_args(&self.sha, keys, args.clone()))
            .await
        {
            Err(e) if e.is_noscript() => {
                debug!("Script {} not cached on server, sending source", self.sha);
                runner
                    .execute("EVAL", Self::eval_args(&self.source, keys, args))
                    .await
            }
            other => other,
        }
    }

    fn eval_args(body: &str, keys: &[&str], args: Vec<RespValue>) -> Vec<RespValue> {
        let mut out = Vec::with_capacity(2 + keys.len() + args.len());
        out.push(RespValue::from(body));
        out.push(RespValue::from(keys.len() as i64));
        out.extend(keys.iter().map(|k| RespValue::from(*k)));
        out.extend(args);
        out
    }
}

/// Calculate SHA1 hash of a string
fn calculate_sha1(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compound operations on one hash bucket
///
/// `KEYS[1]` is always the bucket name and `ARGV[1]` the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    /// Set `ARGV[2]`, returning the previous value
    Put,
    /// Delete, returning the previous value
    Remove,
    /// Delete only if the value equals `ARGV[2]`; returns 1 on success
    RemoveIfEquals,
    /// Set `ARGV[2]` unless present; returns nil or the existing value
    PutIfAbsent,
    /// Set `ARGV[3]` only if the value equals `ARGV[2]`; returns 1 on success
    ReplaceIfEquals,
    /// Set `ARGV[2]` only if present, returning the previous value
    Replace,
}

impl MapOp {
    /// Every map operation
    pub const ALL: [Self; 6] = [
        Self::Put,
        Self::Remove,
        Self::RemoveIfEquals,
        Self::PutIfAbsent,
        Self::ReplaceIfEquals,
        Self::Replace,
    ];

    /// The script implementing this operation
    #[must_use]
    pub fn script(self) -> &'static Script {
        static SCRIPTS: OnceLock<Vec<Script>> = OnceLock::new();
        let scripts = SCRIPTS.get_or_init(|| Self::ALL.iter().map(|op| Script::new(op.source())).collect());
        &scripts[self as usize]
    }

    fn source(self) -> &'static str {
        match self {
            Self::Put => {
                "local v = redis.call('hget', KEYS[1], ARGV[1])\n\
                 redis.call('hset', KEYS[1], ARGV[1], ARGV[2])\n\
                 return v\n"
            }
            Self::Remove => {
                "local v = redis.call('hget', KEYS[1], ARGV[1])\n\
                 redis.call('hdel', KEYS[1], ARGV[1])\n\
                 return v\n"
            }
            Self::RemoveIfEquals => {
                "if redis.call('hget', KEYS[1], ARGV[1]) == ARGV[2] then\n\
                 \x20 return redis.call('hdel', KEYS[1], ARGV[1])\n\
                 end\n\
                 return 0\n"
            }
            Self::PutIfAbsent => {
                "if redis.call('hsetnx', KEYS[1], ARGV[1], ARGV[2]) == 1 then\n\
                 \x20 return nil\n\
                 end\n\
                 return redis.call('hget', KEYS[1], ARGV[1])\n"
            }
            Self::ReplaceIfEquals => {
                "if redis.call('hget', KEYS[1], ARGV[1]) == ARGV[2] then\n\
                 \x20 redis.call('hset', KEYS[1], ARGV[1], ARGV[3])\n\
                 \x20 return 1\n\
                 end\n\
                 return 0\n"
            }
            Self::Replace => {
                "if redis.call('hexists', KEYS[1], ARGV[1]) == 1 then\n\
                 \x20 local v = redis.call('hget', KEYS[1], ARGV[1])\n\
                 \x20 redis.call('hset', KEYS[1], ARGV[1], ARGV[2])\n\
                 \x20 return v\n\
                 end\n\
                 return nil\n"
            }
        }
    }

    /// Look up the operation a SHA belongs to
    #[must_use]
    pub fn from_sha(sha: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.script().sha() == sha)
    }
}
