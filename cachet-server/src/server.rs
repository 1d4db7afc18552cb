//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! per-database storage engines and the pub/sub broker.
//!
//! ## Design Principles
//! 1. **One Task per Connection**: Each connection owns its socket, its
//!    selected database, and its subscriptions.
//! 2. **Batched Writes**: Replies for every command parsed from one read are
//!    written together, so pipelined requests cost one write.
//! 3. **Subscribed Mode**: Once a connection subscribes, only the pub/sub
//!    commands and `PING` are accepted, as in Redis.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use hashbrown::HashSet;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use cachet_common::{parse_score, unix_millis, StoreError};
use cachet_engine::{KVEngine, MemoryEngine};

use crate::metrics::ServerMetrics;
use crate::protocol::{decode_command, RespValue};
use crate::pubsub::{Broker, PushSender};

/// Logical databases addressable with `SELECT`.
pub const DATABASES: usize = 16;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Command-level failures, rendered as RESP error replies.
#[derive(Debug, Error)]
enum CommandError {
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("wrong number of arguments for '{0}' command")]
    Arity(String),
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("invalid expire time in '{0}' command")]
    InvalidExpire(String),
    #[error("DB index is out of range")]
    DbIndex,
    #[error("Can't execute '{0}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context")]
    Subscribed(String),
}

impl CommandError {
    fn into_reply(self) -> RespValue {
        let code = match &self {
            CommandError::Store(err) => err.code(),
            _ => "ERR",
        };
        RespValue::error(code, &self.to_string())
    }
}

type CommandResult = Result<RespValue, CommandError>;

struct ServerState {
    databases: Vec<Arc<MemoryEngine>>,
    broker: Broker,
    metrics: Arc<ServerMetrics>,
    next_id: AtomicU64,
}

/// A running embedded store.
///
/// Dropping the handle shuts the server down.
pub struct EmbeddedServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: watch::Sender<bool>,
    kick: watch::Sender<u64>,
}

impl EmbeddedServer {
    /// Binds `addr` and starts serving in the background.
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::start(listener)
    }

    /// Starts serving on an already bound listener.
    pub fn start(listener: TcpListener) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            databases: (0..DATABASES)
                .map(|_| Arc::new(MemoryEngine::with_shard_count(4)))
                .collect(),
            broker: Broker::new(),
            metrics: Arc::new(ServerMetrics::new()),
            next_id: AtomicU64::new(1),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (kick, kick_rx) = watch::channel(0u64);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown_rx.clone(),
            kick_rx,
        ));
        tokio::spawn(sweep_loop(Arc::clone(&state), shutdown_rx));
        info!(addr = %local_addr, "embedded store listening");

        Ok(EmbeddedServer {
            local_addr,
            state,
            shutdown,
            kick,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.state.metrics)
    }

    /// Engine backing logical database `index`.
    pub fn database(&self, index: usize) -> Option<Arc<MemoryEngine>> {
        self.state.databases.get(index).cloned()
    }

    /// Closes every open connection but keeps accepting new ones.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
    kick: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let session = Session::new(Arc::clone(&state));
                    let shutdown = shutdown.clone();
                    let mut kick = kick.clone();
                    kick.borrow_and_update();
                    tokio::spawn(async move {
                        debug!(%peer, id = session.id, "connection accepted");
                        if let Err(err) = session.run(stream, shutdown, kick).await {
                            debug!(%peer, error = %err, "connection error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
    debug!("accept loop stopped");
}

async fn sweep_loop(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let now = std::time::Instant::now();
                for engine in &state.databases {
                    engine.purge_expired(now);
                }
            }
        }
    }
}

/// Per-connection state.
struct Session {
    id: u64,
    state: Arc<ServerState>,
    database: usize,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
    push: PushSender,
    push_rx: mpsc::UnboundedReceiver<RespValue>,
}

impl Session {
    fn new(state: Arc<ServerState>) -> Self {
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let (push, push_rx) = mpsc::unbounded_channel();
        Session {
            id,
            state,
            database: 0,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            push,
            push_rx,
        }
    }

    async fn run(
        mut self,
        mut stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
        mut kick: watch::Receiver<u64>,
    ) -> std::io::Result<()> {
        self.state.metrics.record_connection_open();
        let outcome = self.serve(&mut stream, &mut shutdown, &mut kick).await;
        self.release_subscriptions();
        self.state.metrics.record_connection_close();
        outcome
    }

    async fn serve(
        &mut self,
        stream: &mut TcpStream,
        shutdown: &mut watch::Receiver<bool>,
        kick: &mut watch::Receiver<u64>,
    ) -> std::io::Result<()> {
        let mut buffer = BytesMut::with_capacity(8 * 1024);
        let mut out = Vec::with_capacity(1024);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = kick.changed() => return Ok(()),
                Some(frame) = self.push_rx.recv() => {
                    out.clear();
                    frame.encode(&mut out);
                    stream.write_all(&out).await?;
                }
                read = stream.read_buf(&mut buffer) => {
                    if read? == 0 {
                        return Ok(());
                    }
                    out.clear();
                    loop {
                        match decode_command(&mut buffer) {
                            Ok(Some(args)) if args.is_empty() => continue,
                            Ok(Some(args)) => {
                                for reply in self.execute(&args) {
                                    reply.encode(&mut out);
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                RespValue::error("ERR", &format!("Protocol error: {err}")).encode(&mut out);
                                stream.write_all(&out).await?;
                                return Ok(());
                            }
                        }
                    }
                    stream.write_all(&out).await?;
                }
            }
        }
    }

    fn release_subscriptions(&mut self) {
        for channel in self.channels.drain() {
            self.state.broker.unsubscribe(self.id, &channel);
        }
        for pattern in self.patterns.drain() {
            self.state.broker.punsubscribe(self.id, &pattern);
        }
    }

    fn subscriptions(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }

    fn engine(&self) -> &MemoryEngine {
        &self.state.databases[self.database]
    }

    /// Runs one command; pub/sub commands may produce several replies.
    fn execute(&mut self, args: &[Vec<u8>]) -> Vec<RespValue> {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let replies = match name.as_str() {
            "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                self.subscription_command(&name, &args[1..])
            }
            _ if self.subscriptions() > 0 && name != "PING" && name != "QUIT" => {
                Err(CommandError::Subscribed(name.clone()))
            }
            _ => self.dispatch(&name, args).map(|reply| vec![reply]),
        };

        match replies {
            Ok(replies) => {
                self.state.metrics.record_command(false);
                replies
            }
            Err(err) => {
                self.state.metrics.record_command(true);
                vec![err.into_reply()]
            }
        }
    }

    fn dispatch(&mut self, name: &str, args: &[Vec<u8>]) -> CommandResult {
        match name {
            "PING" => self.handle_ping(args),
            "QUIT" => Ok(RespValue::ok()),
            "SELECT" => self.handle_select(args),
            "INFO" => Ok(self.handle_info()),
            "CLIENT" => handle_client(args),
            "GET" => handle_get(self.engine(), args),
            "SET" => handle_set(self.engine(), args),
            "DEL" => handle_del(self.engine(), args),
            "EXISTS" => handle_exists(self.engine(), args),
            "TYPE" => handle_type(self.engine(), args),
            "EXPIRE" => handle_expire(self.engine(), args, Duration::from_secs),
            "PEXPIRE" => handle_expire(self.engine(), args, Duration::from_millis),
            "PEXPIREAT" => handle_pexpireat(self.engine(), args),
            "PERSIST" => handle_persist(self.engine(), args),
            "RENAME" => handle_rename(self.engine(), args),
            "TTL" => handle_ttl(self.engine(), args, false),
            "PTTL" => handle_ttl(self.engine(), args, true),
            "SADD" => handle_sadd(self.engine(), args),
            "SREM" => handle_srem(self.engine(), args),
            "SISMEMBER" => handle_sismember(self.engine(), args),
            "SMEMBERS" => handle_smembers(self.engine(), args),
            "ZADD" => handle_zadd(self.engine(), args),
            "ZRANGEBYSCORE" => handle_zrangebyscore(self.engine(), args),
            "ZREMRANGEBYSCORE" => handle_zremrangebyscore(self.engine(), args),
            "PUBLISH" => self.handle_publish(args),
            _ => Err(CommandError::Unknown(name.to_string())),
        }
    }

    fn handle_ping(&self, args: &[Vec<u8>]) -> CommandResult {
        let payload = match args.len() {
            1 => None,
            2 => Some(args[1].clone()),
            _ => return Err(arity("ping")),
        };
        if self.subscriptions() > 0 {
            return Ok(RespValue::Array(vec![
                RespValue::bulk("pong"),
                RespValue::bulk(payload.unwrap_or_default()),
            ]));
        }
        Ok(match payload {
            Some(payload) => RespValue::bulk(payload),
            None => RespValue::Simple(b"PONG".to_vec()),
        })
    }

    fn handle_select(&mut self, args: &[Vec<u8>]) -> CommandResult {
        expect_args(args, 2, "select")?;
        let index = integer_arg(&args[1])?;
        if index < 0 || index as usize >= DATABASES {
            return Err(CommandError::DbIndex);
        }
        self.database = index as usize;
        Ok(RespValue::ok())
    }

    fn handle_info(&self) -> RespValue {
        let metrics = self.state.metrics.snapshot();
        let info = format!(
            "role:master\r\nengine:cachet\r\nconnected_clients:{}\r\ntotal_connections_received:{}\r\ntotal_commands_processed:{}\r\n",
            metrics.connections_active, metrics.connections_total, metrics.commands_total
        );
        RespValue::bulk(info)
    }

    fn handle_publish(&self, args: &[Vec<u8>]) -> CommandResult {
        expect_args(args, 3, "publish")?;
        let delivered = self.state.broker.publish(&args[1], &args[2]);
        self.state.metrics.record_delivered(delivered as u64);
        Ok(RespValue::Integer(delivered as i64))
    }

    fn subscription_command(&mut self, name: &str, names: &[Vec<u8>]) -> Result<Vec<RespValue>, CommandError> {
        let kind = name.to_ascii_lowercase();
        let subscribing = name == "SUBSCRIBE" || name == "PSUBSCRIBE";
        let pattern = name.starts_with('P');
        if subscribing && names.is_empty() {
            return Err(arity(&kind));
        }

        let targets: Vec<Vec<u8>> = if names.is_empty() {
            // Bare UNSUBSCRIBE / PUNSUBSCRIBE drops every subscription of that kind.
            let current = if pattern { &self.patterns } else { &self.channels };
            current.iter().cloned().collect()
        } else {
            names.to_vec()
        };

        if targets.is_empty() {
            return Ok(vec![RespValue::Array(vec![
                RespValue::bulk(kind),
                RespValue::Bulk(None),
                RespValue::Integer(self.subscriptions()),
            ])]);
        }

        let mut replies = Vec::with_capacity(targets.len());
        for target in targets {
            let broker = &self.state.broker;
            match (subscribing, pattern) {
                (true, false) => {
                    if self.channels.insert(target.clone()) {
                        broker.subscribe(self.id, &target, &self.push);
                    }
                }
                (true, true) => {
                    if self.patterns.insert(target.clone()) {
                        broker.psubscribe(self.id, &target, &self.push);
                    }
                }
                (false, false) => {
                    if self.channels.remove(&target) {
                        broker.unsubscribe(self.id, &target);
                    }
                }
                (false, true) => {
                    if self.patterns.remove(&target) {
                        broker.punsubscribe(self.id, &target);
                    }
                }
            }
            replies.push(RespValue::Array(vec![
                RespValue::bulk(kind.clone()),
                RespValue::bulk(target),
                RespValue::Integer(self.subscriptions()),
            ]));
        }
        Ok(replies)
    }
}

fn handle_get(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 2, "get")?;
    Ok(match engine.get(&args[1])? {
        Some(value) => RespValue::bulk(value.to_vec()),
        None => RespValue::Bulk(None),
    })
}

/// `SET key value [EX seconds | PX milliseconds]`.
fn handle_set(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    let ttl = match args.len() {
        3 => None,
        5 => {
            let amount = integer_arg(&args[4])?;
            if amount <= 0 {
                return Err(CommandError::InvalidExpire("set".to_string()));
            }
            let amount = amount as u64;
            if args[3].eq_ignore_ascii_case(b"EX") {
                Some(Duration::from_secs(amount))
            } else if args[3].eq_ignore_ascii_case(b"PX") {
                Some(Duration::from_millis(amount))
            } else {
                return Err(StoreError::Syntax.into());
            }
        }
        0..=2 => return Err(arity("set")),
        _ => return Err(StoreError::Syntax.into()),
    };
    engine.set(args[1].clone(), args[2].clone(), ttl)?;
    Ok(RespValue::ok())
}

fn handle_del(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 2 {
        return Err(arity("del"));
    }
    let mut removed = 0i64;
    for key in &args[1..] {
        if engine.delete(key)? {
            removed += 1;
        }
    }
    Ok(RespValue::Integer(removed))
}

fn handle_exists(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 2 {
        return Err(arity("exists"));
    }
    let mut found = 0i64;
    for key in &args[1..] {
        if engine.exists(key)? {
            found += 1;
        }
    }
    Ok(RespValue::Integer(found))
}

fn handle_type(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 2, "type")?;
    let kind = engine.key_type(&args[1])?.unwrap_or("none");
    Ok(RespValue::Simple(kind.as_bytes().to_vec()))
}

/// `CLIENT SETNAME` and `CLIENT SETINFO` are accepted and ignored; clients
/// send them while setting up a connection.
fn handle_client(args: &[Vec<u8>]) -> CommandResult {
    match args.get(1) {
        Some(sub) if sub.eq_ignore_ascii_case(b"SETINFO") || sub.eq_ignore_ascii_case(b"SETNAME") => {
            Ok(RespValue::ok())
        }
        Some(sub) => Err(CommandError::Unknown(format!(
            "client|{}",
            String::from_utf8_lossy(sub).to_ascii_lowercase()
        ))),
        None => Err(arity("client")),
    }
}

/// `EXPIRE` / `PEXPIRE`; a non-positive amount expires the key at once.
fn handle_expire(engine: &MemoryEngine, args: &[Vec<u8>], unit: fn(u64) -> Duration) -> CommandResult {
    expect_args(args, 3, "expire")?;
    let amount = integer_arg(&args[2])?;
    let ttl = if amount <= 0 { Duration::ZERO } else { unit(amount as u64) };
    Ok(flag(engine.expire(&args[1], ttl)?))
}

fn handle_pexpireat(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 3, "pexpireat")?;
    let at = integer_arg(&args[2])?.max(0) as u64;
    let now = unix_millis(SystemTime::now());
    let ttl = Duration::from_millis(at.saturating_sub(now));
    Ok(flag(engine.expire(&args[1], ttl)?))
}

fn handle_persist(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 2, "persist")?;
    Ok(flag(engine.persist(&args[1])?))
}

fn handle_rename(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 3, "rename")?;
    engine.rename(&args[1], args[2].clone())?;
    Ok(RespValue::ok())
}

fn handle_ttl(engine: &MemoryEngine, args: &[Vec<u8>], millis: bool) -> CommandResult {
    expect_args(args, 2, if millis { "pttl" } else { "ttl" })?;
    let ttl = engine.ttl(&args[1])?;
    Ok(RespValue::Integer(if millis {
        ttl.as_millis_reply()
    } else {
        ttl.as_seconds_reply()
    }))
}

fn handle_sadd(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 3 {
        return Err(arity("sadd"));
    }
    let added = engine.sadd(&args[1], args[2..].to_vec())?;
    Ok(RespValue::Integer(added as i64))
}

fn handle_srem(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 3 {
        return Err(arity("srem"));
    }
    let removed = engine.srem(&args[1], &args[2..])?;
    Ok(RespValue::Integer(removed as i64))
}

fn handle_sismember(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 3, "sismember")?;
    Ok(flag(engine.sismember(&args[1], &args[2])?))
}

fn handle_smembers(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 2, "smembers")?;
    Ok(RespValue::bulk_array(engine.smembers(&args[1])?))
}

/// `ZADD key score member [score member ...]`.
fn handle_zadd(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 4 || (args.len() - 2) % 2 != 0 {
        return Err(arity("zadd"));
    }
    let pairs = args[2..]
        .chunks(2)
        .map(|pair| Ok((score_arg(&pair[0])?, pair[1].clone())))
        .collect::<Result<Vec<_>, CommandError>>()?;

    let mut added = 0i64;
    for (score, member) in pairs {
        if engine.zadd(&args[1], score, member)? {
            added += 1;
        }
    }
    Ok(RespValue::Integer(added))
}

/// `ZRANGEBYSCORE key min max [LIMIT offset count]`.
fn handle_zrangebyscore(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    let limit = match args.len() {
        4 => None,
        7 if args[4].eq_ignore_ascii_case(b"LIMIT") => {
            let offset = integer_arg(&args[5])?;
            let count = integer_arg(&args[6])?;
            if offset < 0 {
                return Ok(RespValue::Array(Vec::new()));
            }
            // A negative count means "all remaining".
            let count = if count < 0 { usize::MAX } else { count as usize };
            Some((offset as usize, count))
        }
        0..=3 => return Err(arity("zrangebyscore")),
        _ => return Err(StoreError::Syntax.into()),
    };
    let min = score_arg(&args[2])?;
    let max = score_arg(&args[3])?;
    Ok(RespValue::bulk_array(
        engine.zrange_by_score(&args[1], min, max, limit)?,
    ))
}

fn handle_zremrangebyscore(engine: &MemoryEngine, args: &[Vec<u8>]) -> CommandResult {
    expect_args(args, 4, "zremrangebyscore")?;
    let min = score_arg(&args[2])?;
    let max = score_arg(&args[3])?;
    let removed = engine.zrem_range_by_score(&args[1], min, max)?;
    Ok(RespValue::Integer(removed as i64))
}

fn flag(value: bool) -> RespValue {
    RespValue::Integer(value as i64)
}

fn arity(command: &str) -> CommandError {
    CommandError::Arity(command.to_string())
}

fn expect_args(args: &[Vec<u8>], count: usize, command: &str) -> Result<(), CommandError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(arity(command))
    }
}

fn integer_arg(arg: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(StoreError::NotAnInteger)
}

fn score_arg(arg: &[u8]) -> Result<f64, StoreError> {
    parse_score(arg).ok_or(StoreError::NotAFloat)
}
