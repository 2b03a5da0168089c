//! In-process RESP server for unit tests
//!
//! Speaks the command subset the crate relies on, over a real socket, using
//! the crate's own codec. The map scripts are recognized by source or SHA
//! and executed natively under the store lock, which gives them the same
//! all-or-nothing behaviour the real server provides.

use crate::protocol::{RespDecoder, RespEncoder};
use crate::script::{MapOp, Script};
use bytes::{Buf, Bytes, BytesMut};
use redis_mesh_core::value::RespValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub(crate) struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    kill: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start() -> Self {
        Self::spawn(None).await
    }

    pub(crate) async fn start_with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_string())).await
    }

    async fn spawn(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::new(password));
        let (kill, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let kill = accept_kill.subscribe();
                tokio::spawn(serve(state, socket, kill));
            }
        });

        Self {
            addr,
            state,
            kill,
            accept_task,
        }
    }

    pub(crate) fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Close every open connection; new ones are still accepted
    pub(crate) fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    pub(crate) fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Remove a key as if its TTL had lapsed
    pub(crate) fn expire_key(&self, key: &str) -> bool {
        self.state.store.lock().unwrap().entries.remove(key).is_some()
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.state.store.lock().unwrap().live(key).is_some()
    }

    pub(crate) fn ttl_of(&self, key: &str) -> Option<Duration> {
        let mut store = self.state.store.lock().unwrap();
        store
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of `EVAL` calls that carried a full script body
    pub(crate) fn full_evals(&self) -> usize {
        self.state.full_evals.load(Ordering::SeqCst)
    }

    /// Number of commands executed so far
    pub(crate) fn commands(&self) -> usize {
        self.state.commands.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = self.kill.send(());
    }
}

enum Value {
    Str(String),
    Hash(BTreeMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, Entry>,
}

impl Store {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>, RespValue> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(Some(map)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, RespValue> {
        if self.hash(key)?.is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(BTreeMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map),
            _ => Err(wrong_type()),
        }
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, RespValue> {
        Ok(self.hash(key)?.and_then(|m| m.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool, RespValue> {
        Ok(self
            .hash_or_create(key)?
            .insert(field.to_string(), value.to_string())
            .is_none())
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool, RespValue> {
        let (removed, now_empty) = match self.hash(key)? {
            Some(map) => (map.remove(field).is_some(), map.is_empty()),
            None => (false, false),
        };
        if now_empty {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn run_map_op(&mut self, op: MapOp, key: &str, argv: &[String]) -> Result<RespValue, RespValue> {
        let arg = |i: usize| {
            argv.get(i)
                .map(String::as_str)
                .ok_or_else(|| err("ERR missing script argument"))
        };
        let field = arg(0)?;
        let current = self.hget(key, field)?;
        let reply = match op {
            MapOp::Put => {
                self.hset(key, field, arg(1)?)?;
                optional(current)
            }
            MapOp::Remove => {
                self.hdel(key, field)?;
                optional(current)
            }
            MapOp::RemoveIfEquals => {
                if current.as_deref() == Some(arg(1)?) {
                    RespValue::Integer(i64::from(self.hdel(key, field)?))
                } else {
                    RespValue::Integer(0)
                }
            }
            MapOp::PutIfAbsent => {
                if current.is_none() {
                    self.hset(key, field, arg(1)?)?;
                }
                optional(current)
            }
            MapOp::ReplaceIfEquals => {
                if current.as_deref() == Some(arg(1)?) {
                    self.hset(key, field, arg(2)?)?;
                    RespValue::Integer(1)
                } else {
                    RespValue::Integer(0)
                }
            }
            MapOp::Replace => {
                if current.is_some() {
                    self.hset(key, field, arg(1)?)?;
                }
                optional(current)
            }
        };
        Ok(reply)
    }
}

struct ServerState {
    password: Option<String>,
    store: Mutex<Store>,
    scripts: Mutex<HashSet<String>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<RespValue>>>>,
    fail_pings: AtomicBool,
    full_evals: AtomicUsize,
    commands: AtomicUsize,
}

struct Session {
    authenticated: bool,
    push: mpsc::UnboundedSender<RespValue>,
    subscriptions: i64,
}

impl ServerState {
    fn new(password: Option<String>) -> Self {
        Self {
            password,
            store: Mutex::new(Store::default()),
            scripts: Mutex::new(HashSet::new()),
            subscribers: Mutex::new(HashMap::new()),
            fail_pings: AtomicBool::new(false),
            full_evals: AtomicUsize::new(0),
            commands: AtomicUsize::new(0),
        }
    }

    fn handle(&self, session: &mut Session, frame: RespValue) -> Vec<RespValue> {
        let parts = match frame {
            RespValue::Array(items) if !items.is_empty() => items,
            _ => return vec![err("ERR protocol error: expected a command array")],
        };
        let mut words: Vec<String> = parts
            .iter()
            .map(|p| match p {
                RespValue::BulkString(b) => String::from_utf8_lossy(b).into_owned(),
                RespValue::SimpleString(s) => s.clone(),
                RespValue::Integer(i) => i.to_string(),
                _ => String::new(),
            })
            .collect();
        let command = words.remove(0).to_ascii_uppercase();
        self.commands.fetch_add(1, Ordering::SeqCst);

        if !session.authenticated && command != "AUTH" {
            return vec![err("NOAUTH Authentication required.")];
        }
        if command == "SUBSCRIBE" {
            return self.subscribe(session, &words);
        }
        let reply = self.dispatch(session, &command, &words);
        vec![reply.unwrap_or_else(|e| e)]
    }

    fn dispatch(
        &self,
        session: &mut Session,
        command: &str,
        args: &[String],
    ) -> Result<RespValue, RespValue> {
        let arg = |i: usize| {
            args.get(i)
                .map(String::as_str)
                .ok_or_else(|| err(&format!("ERR wrong number of arguments for '{command}'")))
        };
        let mut store = self.store.lock().unwrap();

        match command {
            "PING" => {
                if self.fail_pings.load(Ordering::SeqCst) {
                    Err(err("ERR ping refused"))
                } else {
                    Ok(RespValue::SimpleString("PONG".to_string()))
                }
            }
            "AUTH" => {
                let supplied = args.last().map(String::as_str);
                if self.password.as_deref() == supplied {
                    session.authenticated = true;
                    Ok(ok())
                } else {
                    Err(err("WRONGPASS invalid username-password pair"))
                }
            }
            "SELECT" => Ok(ok()),
            "GET" => match store.live(arg(0)?) {
                None => Ok(RespValue::Null),
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(RespValue::from(s.as_str())),
                Some(_) => Err(wrong_type()),
            },
            "SET" => {
                let expires_at = match args.get(2).map(|s| s.to_ascii_uppercase()).as_deref() {
                    Some("PX") => Some(Duration::from_millis(parse_u64(arg(3)?)?)),
                    Some("EX") => Some(Duration::from_secs(parse_u64(arg(3)?)?)),
                    Some(_) => return Err(err("ERR syntax error")),
                    None => None,
                }
                .map(|ttl| Instant::now() + ttl);
                store.entries.insert(
                    arg(0)?.to_string(),
                    Entry {
                        value: Value::Str(arg(1)?.to_string()),
                        expires_at,
                    },
                );
                Ok(ok())
            }
            "DEL" => {
                let mut removed = 0;
                for key in args {
                    if store.live(key).is_some() {
                        store.entries.remove(key);
                        removed += 1;
                    }
                }
                Ok(RespValue::Integer(removed))
            }
            "EXISTS" => Ok(RespValue::Integer(
                args.iter().filter(|k| store.live(k).is_some()).count() as i64,
            )),
            "HGET" => Ok(optional(store.hget(arg(0)?, arg(1)?)?)),
            "HSET" => {
                let key = arg(0)?;
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(err("ERR wrong number of arguments for 'hset'"));
                }
                let mut added = 0;
                for pair in args[1..].chunks(2) {
                    if store.hset(key, &pair[0], &pair[1])? {
                        added += 1;
                    }
                }
                Ok(RespValue::Integer(added))
            }
            "HSETNX" => {
                let (key, field) = (arg(0)?, arg(1)?);
                if store.hget(key, field)?.is_some() {
                    Ok(RespValue::Integer(0))
                } else {
                    store.hset(key, field, arg(2)?)?;
                    Ok(RespValue::Integer(1))
                }
            }
            "HDEL" => {
                let key = arg(0)?;
                let mut removed = 0;
                for field in &args[1..] {
                    if store.hdel(key, field)? {
                        removed += 1;
                    }
                }
                Ok(RespValue::Integer(removed))
            }
            "HEXISTS" => Ok(RespValue::Integer(i64::from(
                store.hget(arg(0)?, arg(1)?)?.is_some(),
            ))),
            "HLEN" => Ok(RespValue::Integer(
                store.hash(arg(0)?)?.map_or(0, |m| m.len() as i64),
            )),
            "SCAN" => {
                let cursor = parse_u64(arg(0)?)? as usize;
                let mut pattern = "*".to_string();
                let mut count = 10usize;
                let mut i = 1;
                while i < args.len() {
                    match args[i].to_ascii_uppercase().as_str() {
                        "MATCH" => pattern = arg(i + 1)?.to_string(),
                        "COUNT" => count = parse_u64(arg(i + 1)?)?.max(1) as usize,
                        _ => return Err(err("ERR syntax error")),
                    }
                    i += 2;
                }
                let keys = store.live_keys();
                let end = (cursor + count).min(keys.len());
                let page: Vec<RespValue> = keys
                    .get(cursor..end)
                    .unwrap_or(&[])
                    .iter()
                    .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
                    .map(|k| RespValue::from(k.as_str()))
                    .collect();
                let next = if end < keys.len() { end } else { 0 };
                Ok(RespValue::Array(vec![
                    RespValue::from(next.to_string()),
                    RespValue::Array(page),
                ]))
            }
            "EVAL" | "EVALSHA" => {
                let body = arg(0)?;
                let op = if command == "EVAL" {
                    let op = MapOp::ALL
                        .into_iter()
                        .find(|op| op.script().source() == body)
                        .ok_or_else(|| err("ERR test server only runs the map scripts"))?;
                    self.full_evals.fetch_add(1, Ordering::SeqCst);
                    self.scripts
                        .lock()
                        .unwrap()
                        .insert(op.script().sha().to_string());
                    op
                } else {
                    if !self.scripts.lock().unwrap().contains(body) {
                        return Err(err("NOSCRIPT No matching script. Please use EVAL."));
                    }
                    MapOp::from_sha(body).ok_or_else(|| err("NOSCRIPT unknown sha"))?
                };
                let numkeys = parse_u64(arg(1)?)? as usize;
                let key = arg(2)?;
                let argv = args.get(2 + numkeys..).unwrap_or(&[]);
                store.run_map_op(op, key, argv)
            }
            "SCRIPT" => {
                if !arg(0)?.eq_ignore_ascii_case("LOAD") {
                    return Err(err("ERR test server only supports SCRIPT LOAD"));
                }
                let script = Script::new(arg(1)?);
                if MapOp::from_sha(script.sha()).is_none() {
                    return Err(err("ERR test server only runs the map scripts"));
                }
                self.scripts.lock().unwrap().insert(script.sha().to_string());
                Ok(RespValue::from(script.sha()))
            }
            "PUBLISH" => {
                drop(store);
                let (channel, payload) = (arg(0)?, arg(1)?);
                let message = RespValue::Array(vec![
                    RespValue::from("message"),
                    RespValue::from(channel),
                    RespValue::BulkString(Bytes::from(payload.to_string())),
                ]);
                let mut subscribers = self.subscribers.lock().unwrap();
                let mut delivered = 0;
                if let Some(list) = subscribers.get_mut(channel) {
                    list.retain(|tx| tx.send(message.clone()).is_ok());
                    delivered = list.len() as i64;
                }
                Ok(RespValue::Integer(delivered))
            }
            other => Err(err(&format!("ERR unknown command '{other}'"))),
        }
    }

    fn subscribe(&self, session: &mut Session, channels: &[String]) -> Vec<RespValue> {
        let mut subscribers = self.subscribers.lock().unwrap();
        channels
            .iter()
            .map(|channel| {
                subscribers
                    .entry(channel.clone())
                    .or_default()
                    .push(session.push.clone());
                session.subscriptions += 1;
                RespValue::Array(vec![
                    RespValue::from("subscribe"),
                    RespValue::from(channel.as_str()),
                    RespValue::Integer(session.subscriptions),
                ])
            })
            .collect()
    }
}

async fn serve(
    state: Arc<ServerState>,
    mut socket: TcpStream,
    mut kill: broadcast::Receiver<()>,
) {
    let (push, mut pushed) = mpsc::unbounded_channel();
    let mut session = Session {
        authenticated: state.password.is_none(),
        push,
        subscriptions: 0,
    };
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let mut out = BytesMut::new();
        loop {
            let mut cursor = Cursor::new(&buf[..]);
            match RespDecoder::decode(&mut cursor) {
                Ok(Some(frame)) => {
                    let consumed = cursor.position() as usize;
                    buf.advance(consumed);
                    for reply in state.handle(&mut session, frame) {
                        RespEncoder::encode(&reply, &mut out);
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        if !out.is_empty() && socket.write_all(&out).await.is_err() {
            return;
        }

        tokio::select! {
            biased;
            _ = kill.recv() => return,
            Some(message) = pushed.recv() => {
                let mut out = BytesMut::new();
                RespEncoder::encode(&message, &mut out);
                if socket.write_all(&out).await.is_err() {
                    return;
                }
            }
            read = socket.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

/// Glob matching with `*`, `?` and backslash escapes
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            (0..=text.len()).any(|skip| glob_match(&pattern[1..], &text[skip..]))
        }
        Some(b'?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some(b'\\') if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && glob_match(&pattern[2..], &text[1..])
        }
        Some(c) => text.first() == Some(c) && glob_match(&pattern[1..], &text[1..]),
    }
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

fn err(message: &str) -> RespValue {
    RespValue::Error(message.to_string())
}

fn wrong_type() -> RespValue {
    err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn optional(value: Option<String>) -> RespValue {
    value.map_or(RespValue::Null, |v| RespValue::from(v.as_str()))
}

fn parse_u64(s: &str) -> Result<u64, RespValue> {
    s.parse()
        .map_err(|_| err("ERR value is not an integer or out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"orbit:node:*", b"orbit:node:10.0.0.1:9000"));
        assert!(!glob_match(b"orbit:node:*", b"orbit:nodes"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(glob_match(b"a\\*c", b"a*c"));
        assert!(!glob_match(b"a\\*c", b"abc"));
        assert!(glob_match(b"*", b""));
    }
}
