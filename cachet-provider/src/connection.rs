//! # Connection Manager
//!
//! Purpose: Own the lazily established, shared handles to the store and make
//! sure at most one establishment attempt runs at a time.
//!
//! ## Design Principles
//! 1. **Lock-Free Reads**: Live handles are published through an
//!    `ArcSwapOption`; once connected, callers never touch a lock.
//! 2. **Single Gate**: Establishment runs under one async mutex with a
//!    re-check after acquiring it, so concurrent callers wait for and then
//!    observe the attempt already in progress.
//! 3. **Owned Drivers**: The multiplexed connection's driver future and the
//!    subscriber's message stream run in tasks spawned here, so a closed
//!    socket is noticed as soon as it happens rather than on the next call.
//! 4. **Retry on Demand**: No background reconnect loop. A broken handle is
//!    replaced by the next caller that needs one.
//! 5. **Single Teardown**: `close` releases both connections and disables any
//!    further establishment, including attempts already in flight.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionManager
//!   ├── connection: ArcSwapOption<Link<MultiplexedConnection>> ◀── driver task
//!   ├── subscriber: ArcSwapOption<Link<PubSubSink>>            ◀── stream task ──▶ Published
//!   ├── gate: tokio::sync::Mutex<()>
//!   └── closed: AtomicBool
//! ```

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink};
use redis::{
    Client, Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo, RedisError,
    RedisResult,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use cachet_common::StoreConfig;

use crate::error::CacheResult;
use crate::notifications::Published;

/// An established connection and the task that keeps it running.
struct Link<C> {
    handle: C,
    alive: Arc<AtomicBool>,
    task: AbortHandle,
}

impl<C> Link<C> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn lost(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn close(&self) {
        self.lost();
        self.task.abort();
    }
}

impl<C> Drop for Link<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Lazily connected shared handles to the store.
pub struct ConnectionManager {
    config: StoreConfig,
    info: ConnectionInfo,
    connection: ArcSwapOption<Link<MultiplexedConnection>>,
    subscriber: ArcSwapOption<Link<PubSubSink>>,
    gate: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.config.addr())
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager; nothing is dialed until the first operation.
    pub fn new(config: StoreConfig) -> Self {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: i64::from(config.database),
                ..RedisConnectionInfo::default()
            },
        };
        ConnectionManager {
            config,
            info,
            connection: ArcSwapOption::empty(),
            subscriber: ArcSwapOption::empty(),
            gate: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True while a live command connection is held.
    pub fn is_connected(&self) -> bool {
        self.live_connection().is_some()
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The live command connection, without dialing.
    pub fn current(&self) -> Option<MultiplexedConnection> {
        self.live_connection().map(|link| link.handle.clone())
    }

    /// The live subscriber sink, without dialing.
    pub fn current_subscriber(&self) -> Option<PubSubSink> {
        self.subscriber
            .load_full()
            .filter(|link| link.is_alive())
            .map(|link| link.handle.clone())
    }

    /// Returns the live connection, establishing it if needed.
    ///
    /// `None` means the store is unavailable: every attempt failed, or the
    /// manager was closed.
    pub async fn ensure_connected(&self) -> Option<MultiplexedConnection> {
        self.ensure_link().await.map(|link| link.handle.clone())
    }

    /// Returns the live subscriber sink, establishing it if needed.
    ///
    /// Messages on the new connection are forwarded to `messages`. The flag
    /// is `true` when the connection was just opened, in which case it
    /// carries no subscriptions yet.
    pub(crate) async fn ensure_subscriber(
        &self,
        messages: &mpsc::UnboundedSender<Published>,
    ) -> Option<(PubSubSink, bool)> {
        if let Some(sink) = self.current_subscriber() {
            return Some((sink, false));
        }
        if self.is_closed() {
            return None;
        }

        let _gate = self.gate.lock().await;
        if let Some(sink) = self.current_subscriber() {
            return Some((sink, false));
        }
        if self.is_closed() {
            return None;
        }

        let link = self
            .establish("subscriber", || self.open_subscriber(messages))
            .await?;
        let link = self.install(&self.subscriber, Arc::new(link))?;
        Some((link.handle.clone(), true))
    }

    /// Runs one command on the shared connection.
    ///
    /// Resolves to `default` when the store is unavailable or the
    /// connection drops before the reply; any other failure propagates.
    pub async fn run<T: FromRedisValue>(&self, command: &Cmd, default: T) -> CacheResult<T> {
        let reply = self
            .request(|mut connection| async move { command.query_async(&mut connection).await })
            .await;
        match reply {
            Some(result) => Ok(result?),
            None => Ok(default),
        }
    }

    /// Hands the live connection to `send`.
    ///
    /// `None` when the store is unavailable or the connection was lost while
    /// `send` ran; the lost connection is retired so the next caller redials.
    pub(crate) async fn request<T, F, Fut>(&self, send: F) -> Option<RedisResult<T>>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let link = self.ensure_link().await?;
        match send(link.handle.clone()).await {
            Err(err) if is_unavailable(&err) => {
                link.lost();
                debug!(addr = %self.config.addr(), error = %err, "connection lost during operation");
                None
            }
            result => Some(result),
        }
    }

    /// Closes both connections; later calls never reconnect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(link) = self.connection.swap(None) {
            link.close();
        }
        if let Some(link) = self.subscriber.swap(None) {
            link.close();
        }
        debug!(addr = %self.config.addr(), "connection manager closed");
    }

    fn live_connection(&self) -> Option<Arc<Link<MultiplexedConnection>>> {
        self.connection.load_full().filter(|link| link.is_alive())
    }

    async fn ensure_link(&self) -> Option<Arc<Link<MultiplexedConnection>>> {
        if let Some(link) = self.live_connection() {
            return Some(link);
        }
        if self.is_closed() {
            return None;
        }

        let _gate = self.gate.lock().await;
        if let Some(link) = self.live_connection() {
            return Some(link);
        }
        if self.is_closed() {
            return None;
        }

        let link = self.establish("command", || self.open_command()).await?;
        self.install(&self.connection, Arc::new(link))
    }

    /// Stores a fresh link in `slot`, retiring the stale one.
    ///
    /// `close` may run at any point of an establishment, so the flag is read
    /// again once the link is visible; if it is set, the link is taken back
    /// out and closed.
    fn install<C>(&self, slot: &ArcSwapOption<Link<C>>, link: Arc<Link<C>>) -> Option<Arc<Link<C>>> {
        if let Some(stale) = slot.swap(Some(Arc::clone(&link))) {
            stale.close();
        }
        if self.is_closed() {
            if let Some(link) = slot.swap(None) {
                link.close();
            }
            link.close();
            return None;
        }
        Some(link)
    }

    /// Runs up to `1 + connect_retry` attempts.
    async fn establish<T, F, Fut>(&self, role: &'static str, mut open: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let addr = self.config.addr();
        let attempts = self.config.connect_retry.saturating_add(1);
        for attempt in 1..=attempts {
            match open().await {
                Ok(handle) => {
                    info!(addr = %addr, role, attempt, "connected to store");
                    return Some(handle);
                }
                Err(err) => {
                    warn!(addr = %addr, role, attempt, error = %err, "connect attempt failed");
                }
            }
        }
        warn!(addr = %addr, role, attempts, "store unavailable");
        None
    }

    /// Dials, selects the database, and spawns the connection driver.
    async fn open_command(&self) -> RedisResult<Link<MultiplexedConnection>> {
        let config = &self.config;
        let (connection, driver) = within(config.connect_timeout, async {
            let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
            stream.set_nodelay(true)?;
            MultiplexedConnection::new_with_response_timeout(
                &self.info.redis,
                stream,
                Some(config.operation_timeout),
            )
            .await
        })
        .await?;

        let alive = Arc::new(AtomicBool::new(true));
        let pinger = config.keep_alive.filter(|period| !period.is_zero());
        let task = tokio::spawn(drive(
            driver,
            pinger.map(|period| (period, connection.clone())),
            Arc::clone(&alive),
            config.addr(),
        ));
        Ok(Link {
            handle: connection,
            alive,
            task: task.abort_handle(),
        })
    }

    /// Opens the subscriber and forwards its messages to `messages`.
    async fn open_subscriber(
        &self,
        messages: &mpsc::UnboundedSender<Published>,
    ) -> RedisResult<Link<PubSubSink>> {
        let client = Client::open(self.info.clone())?;
        let pubsub = within(self.config.connect_timeout, client.get_async_pubsub()).await?;
        let (sink, mut stream) = pubsub.split();

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let messages = messages.clone();
        let addr = self.config.addr();
        let task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                if messages.send(Published::from(&message)).is_err() {
                    break;
                }
            }
            flag.store(false, Ordering::Release);
            debug!(addr = %addr, "subscriber connection closed");
        });
        Ok(Link {
            handle: sink,
            alive,
            task: task.abort_handle(),
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Polls the connection driver until the socket closes, sending a `PING`
/// every keep-alive period when one is configured.
async fn drive<D>(
    driver: D,
    pinger: Option<(Duration, MultiplexedConnection)>,
    alive: Arc<AtomicBool>,
    addr: String,
) where
    D: Future<Output = ()>,
{
    tokio::pin!(driver);
    match pinger {
        None => driver.await,
        Some((period, mut connection)) => {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = &mut driver => break,
                    _ = ticks.tick() => {
                        let ping = keep_alive_ping(&mut connection);
                        // The driver must keep running for the reply to arrive.
                        let pong = tokio::select! {
                            () = &mut driver => break,
                            pong = ping => pong,
                        };
                        if let Err(err) = pong {
                            warn!(addr = %addr, error = %err, "keep-alive ping failed");
                            break;
                        }
                    }
                }
            }
        }
    }
    alive.store(false, Ordering::Release);
    debug!(addr = %addr, "command connection closed");
}

async fn keep_alive_ping(connection: &mut MultiplexedConnection) -> RedisResult<String> {
    redis::cmd("PING").query_async(connection).await
}

async fn within<T, F>(limit: Duration, attempt: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match time::timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
    }
}

/// Failures that mean the connection itself is gone, as opposed to the store
/// rejecting the command. Reply timeouts are reported, not degraded.
pub(crate) fn is_unavailable(err: &RedisError) -> bool {
    err.is_connection_dropped()
        || err.is_connection_refusal()
        || (err.is_io_error() && !err.is_timeout())
}

#[cfg(test)]
mod tests {
    use cachet_server::EmbeddedServer;
    use redis::ErrorKind;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, Notify};

    use super::*;

    #[test]
    fn dropped_connections_are_unavailable_but_replies_are_not() {
        let broken = RedisError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        let reset = RedisError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        let timed_out = RedisError::from(io::Error::from(io::ErrorKind::TimedOut));
        let rejected = RedisError::from((ErrorKind::ResponseError, "boom"));

        assert!(is_unavailable(&broken));
        assert!(is_unavailable(&reset));
        assert!(!is_unavailable(&timed_out));
        assert!(!is_unavailable(&rejected));
    }

    #[tokio::test]
    async fn closed_manager_never_dials() {
        let manager = ConnectionManager::new(StoreConfig::default());
        manager.close();
        assert!(manager.ensure_connected().await.is_none());
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn close_during_connect_discards_the_new_connection() {
        let server = EmbeddedServer::bind("127.0.0.1:0").await.expect("bind");
        let upstream = server.local_addr();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // Holds the handshake open until `release` fires. A non-zero database
        // makes the client wait for its SELECT reply.
        let (accepted_tx, accepted) = oneshot::channel();
        let release = Arc::new(Notify::new());
        let held = Arc::clone(&release);
        tokio::spawn(async move {
            let (mut inbound, _) = listener.accept().await.expect("accept");
            let _ = accepted_tx.send(());
            held.notified().await;
            let mut outbound = TcpStream::connect(upstream).await.expect("upstream");
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
        });

        let mut config = StoreConfig::new("127.0.0.1", port);
        config.database = 1;
        config.connect_retry = 0;
        config.keep_alive = None;
        let manager = Arc::new(ConnectionManager::new(config));
        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.ensure_connected().await.is_some() }
        });

        accepted.await.expect("accepted");
        manager.close();
        release.notify_one();

        assert!(!connecting.await.expect("join"));
        assert!(!manager.is_connected());
        assert!(manager.current().is_none());
        assert!(manager.ensure_connected().await.is_none());
    }
}
